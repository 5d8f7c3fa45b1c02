#[allow(unused_imports)]
#[macro_use]
extern crate static_assertions;

#[macro_use]
extern crate lazy_static;

pub mod decl;
pub mod dispatch;
pub mod encode;
pub mod errors;
pub mod helper;
pub mod layout;
pub mod llvm;
