//! Declarative migrations for the recurring schema changes.
//!
//! Each primitive is configured with collection and field metadata and implements
//! [`EventMigration`](crate::migration::EventMigration) once, covering every event variant that
//! can carry field data.

mod add_fields;
mod remove_fields;
mod rename_field;
mod sequential_numbers;

pub use add_fields::AddFieldsMigration;
pub use remove_fields::RemoveFieldsMigration;
pub use rename_field::{RenameFieldMigration, ValueTransform};
pub use sequential_numbers::SequentialNumbersMigration;
