//! Access to the customer on whose behalf a check runs.

use parking_lot::RwLock;

use crate::models::Customer;

/// Supplies the current customer for the overloads that do not take one.
pub trait WorkContext: Send + Sync {
    fn current_customer(&self) -> Option<Customer>;
}

/// A context holding a swappable customer. Hosts that resolve customers per
/// request implement [`WorkContext`] themselves.
#[derive(Debug, Default)]
pub struct StaticWorkContext {
    customer: RwLock<Option<Customer>>,
}

impl StaticWorkContext {
    pub fn new(customer: Option<Customer>) -> Self {
        Self {
            customer: RwLock::new(customer),
        }
    }

    pub fn set_customer(&self, customer: Option<Customer>) {
        *self.customer.write() = customer;
    }
}

impl WorkContext for StaticWorkContext {
    fn current_customer(&self) -> Option<Customer> {
        self.customer.read().clone()
    }
}
