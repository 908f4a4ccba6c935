//! Task identifier generation.

use uuid::Uuid;

use crate::model::TaskId;

/// Produces globally unique task identifiers.
///
/// `Send + Sync` so one factory can be shared by every producer.
pub trait UuidFactory: Send + Sync {
    fn create(&self) -> TaskId;
}

/// Random (v4) UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomUuidFactory;

impl UuidFactory for RandomUuidFactory {
    fn create(&self) -> TaskId {
        TaskId(Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_factory_generates_unique_ids() {
        let factory = RandomUuidFactory;
        let a = factory.create();
        let b = factory.create();
        assert_ne!(a, b);
    }
}
