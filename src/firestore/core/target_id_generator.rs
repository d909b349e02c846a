use crate::firestore::model::TargetId;

/// Hands out target ids in steps of two so the two allocators never collide:
/// cached query targets are even, limbo resolution targets are odd.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// Even ids, continuing after `highest_target_id`.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        let last_id = if highest_target_id % 2 == 0 {
            highest_target_id.max(0)
        } else {
            highest_target_id.max(0) + 1
        };
        Self { last_id }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_ids_are_even_and_resume_after_highest() {
        let mut generator = TargetIdGenerator::for_target_cache(0);
        assert_eq!(generator.next(), 2);
        assert_eq!(generator.next(), 4);
        let mut resumed = TargetIdGenerator::for_target_cache(10);
        assert_eq!(resumed.next(), 12);
    }

    #[test]
    fn sync_engine_ids_are_odd() {
        let mut generator = TargetIdGenerator::for_sync_engine();
        assert_eq!(generator.next(), 1);
        assert_eq!(generator.next(), 3);
    }
}
