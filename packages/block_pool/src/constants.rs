// A poisoned lock means a panic interrupted a pool operation half way, so the block structures
// may disagree with each other. Nothing handed out by the pool can be trusted anymore.
pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock - the pool state may be \
    inconsistent and continued execution is not safe";
