//! Dynamic dispatch metadata for classes.
//!
//! Builds the class dispatch table, the per interface tables with their
//! subobject pointers, and the runtime type descriptor every aggregate
//! gets. All of it hangs off the layout records in [crate::layout].

pub mod descriptor;
pub mod interfaces;
pub mod vtable;
