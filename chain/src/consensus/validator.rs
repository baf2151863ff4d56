//! Block validity predicates used by consensus.

use crate::types::Block;

use super::error::ValidationError;

/// Pluggable validity predicate for blocks.
///
/// Implementations should be deterministic and side-effect free. `parent`
/// is the block the candidate would extend.
pub trait BlockValidator {
    fn validate(&self, block: &Block, parent: &Block) -> Result<(), ValidationError>;
}

/// A validator that composes two other validators.
///
/// `CombinedValidator { first, second }` runs `first.validate` and then
/// `second.validate`, failing fast on the first error.
#[derive(Clone, Debug)]
pub struct CombinedValidator<A, B> {
    pub first: A,
    pub second: B,
}

impl<A, B> CombinedValidator<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> BlockValidator for CombinedValidator<A, B>
where
    A: BlockValidator,
    B: BlockValidator,
{
    fn validate(&self, block: &Block, parent: &Block) -> Result<(), ValidationError> {
        self.first.validate(block, parent)?;
        self.second.validate(block, parent)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reject(&'static str);

    impl BlockValidator for Reject {
        fn validate(&self, _block: &Block, _parent: &Block) -> Result<(), ValidationError> {
            Err(ValidationError::Custom(self.0.to_string()))
        }
    }

    struct Accept;

    impl BlockValidator for Accept {
        fn validate(&self, _block: &Block, _parent: &Block) -> Result<(), ValidationError> {
            Ok(())
        }
    }

    #[test]
    fn combined_fails_fast_on_first() {
        let v = CombinedValidator::new(Reject("first"), Reject("second"));
        let g = Block::genesis();
        assert_eq!(
            v.validate(&g, &g),
            Err(ValidationError::Custom("first".into()))
        );
    }

    #[test]
    fn combined_runs_second_after_first_passes() {
        let v = CombinedValidator::new(Accept, Reject("second"));
        let g = Block::genesis();
        assert_eq!(
            v.validate(&g, &g),
            Err(ValidationError::Custom("second".into()))
        );
        assert!(CombinedValidator::new(Accept, Accept).validate(&g, &g).is_ok());
    }
}
