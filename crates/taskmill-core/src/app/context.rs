//! Collaborators shared by the lifecycles and the scheduling facade.

use std::sync::Arc;

use chrono::Utc;

use super::bus::EventBus;
use super::middleware::MiddlewareChain;
use crate::domain::{Decider, OwnerId, TaskEvent};
use crate::ports::{Clock, IdGenerator, TaskStore};
use crate::typed::{TaskDefaults, TaskTypeRegistry};

pub(crate) struct ManagerContext {
    pub owner_id: OwnerId,
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<TaskTypeRegistry>,
    pub middleware: MiddlewareChain,
    pub bus: EventBus,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub decider: Arc<dyn Decider>,
    pub defaults: TaskDefaults,
}

impl ManagerContext {
    pub fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }

    pub fn emit(&self, event: TaskEvent) {
        self.bus.publish(event);
    }
}
