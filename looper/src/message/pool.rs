use super::Message;
use parking_lot::{Mutex, const_mutex};

/// Upper bound on cleared messages kept around for reuse.
pub(crate) const MAX_POOL_SIZE: usize = 50;

// Process-wide free list. Messages are cleared before they get here, so the
// pool never keeps a handler (and through it a looper) alive.
static POOL: Mutex<Vec<Message>> = const_mutex(Vec::new());

pub(super) fn take() -> Option<Message> {
    POOL.lock().pop()
}

pub(super) fn give(msg: Message) {
    debug_assert!(msg.target.is_none() && msg.flags.is_empty());

    let mut pool = POOL.lock();
    if pool.len() < MAX_POOL_SIZE {
        pool.push(msg);
    }
}

#[cfg(test)]
pub(crate) fn len() -> usize {
    POOL.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageFlags, Payload};
    use std::sync::Arc;

    #[test]
    fn test_recycle_clears_identity() {
        let payload: Payload = Arc::new(1_u64);
        let mut msg = Message::obtain().with_what(9).with_args(1, 2).with_obj(payload);
        msg.when = 100;
        msg.seq = 4;
        msg.flags = MessageFlags::IN_USE | MessageFlags::ASYNCHRONOUS;

        msg.recycle();

        // Other tests share the pool, so only check what we can observe
        // deterministically: whatever comes out is fully cleared.
        let reused = Message::obtain();
        assert_eq!(reused.what, 0);
        assert_eq!((reused.arg1, reused.arg2), (0, 0));
        assert!(reused.obj.is_none());
        assert_eq!(reused.when(), 0);
        assert_eq!(reused.sequence(), 0);
        assert!(!reused.is_in_use());
        assert!(!reused.is_asynchronous());
    }

    #[test]
    fn test_pool_is_bounded() {
        for _ in 0..MAX_POOL_SIZE * 2 {
            Message::default().recycle();
        }

        assert!(len() <= MAX_POOL_SIZE);
    }
}
