//! OperationRegistry - which handler runs which operation.
//!
//! One slot per `Operation` variant, selected with an exhaustive `match`.
//! Built during initialization (mutable), read during runtime (immutable),
//! so no locks are needed.

use std::sync::Arc;

use crate::domain::Operation;
use crate::ports::OperationHandler;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for operation '{0}' is already registered")]
    AlreadyRegistered(Operation),
}

type Slot = Option<Arc<dyn OperationHandler>>;

#[derive(Default)]
pub struct OperationRegistry {
    bulkcm_probe: Slot,
    bulkcm_split: Slot,
    bulkcm_parse: Slot,
    meas_parse: Slot,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, op: Operation) -> &Slot {
        match op {
            Operation::BulkcmProbe => &self.bulkcm_probe,
            Operation::BulkcmSplit => &self.bulkcm_split,
            Operation::BulkcmParse => &self.bulkcm_parse,
            Operation::MeasParse => &self.meas_parse,
        }
    }

    fn slot_mut(&mut self, op: Operation) -> &mut Slot {
        match op {
            Operation::BulkcmProbe => &mut self.bulkcm_probe,
            Operation::BulkcmSplit => &mut self.bulkcm_split,
            Operation::BulkcmParse => &mut self.bulkcm_parse,
            Operation::MeasParse => &mut self.meas_parse,
        }
    }

    pub fn register(
        &mut self,
        op: Operation,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<(), RegistryError> {
        let slot = self.slot_mut(op);
        if slot.is_some() {
            return Err(RegistryError::AlreadyRegistered(op));
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn get(&self, op: Operation) -> Option<Arc<dyn OperationHandler>> {
        self.slot(op).clone()
    }

    pub fn registered(&self) -> Vec<Operation> {
        Operation::ALL
            .into_iter()
            .filter(|op| self.slot(*op).is_some())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.registered().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Outcome, TaskArgs};
    use crate::ports::FnOperation;

    fn ok_handler() -> Arc<dyn OperationHandler> {
        Arc::new(FnOperation::new(|_: &TaskArgs| Ok(Outcome::success())))
    }

    #[test]
    fn register_and_get() {
        let mut registry = OperationRegistry::new();
        registry.register(Operation::BulkcmSplit, ok_handler()).unwrap();

        assert!(registry.get(Operation::BulkcmSplit).is_some());
        assert!(registry.get(Operation::BulkcmParse).is_none());
    }

    #[test]
    fn double_registration_is_an_error() {
        let mut registry = OperationRegistry::new();
        registry.register(Operation::MeasParse, ok_handler()).unwrap();
        let result = registry.register(Operation::MeasParse, ok_handler());
        assert_eq!(
            result.unwrap_err(),
            RegistryError::AlreadyRegistered(Operation::MeasParse)
        );
    }

    #[test]
    fn registered_lists_in_declaration_order() {
        let mut registry = OperationRegistry::new();
        assert!(registry.is_empty());

        registry.register(Operation::MeasParse, ok_handler()).unwrap();
        registry.register(Operation::BulkcmProbe, ok_handler()).unwrap();

        assert_eq!(
            registry.registered(),
            vec![Operation::BulkcmProbe, Operation::MeasParse]
        );
    }
}
