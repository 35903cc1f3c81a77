pub mod payments;

pub use payments::{Payment, PaymentsService};
