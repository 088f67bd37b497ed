#![allow(unused_imports)]

//! Database models split into separate files.
//! This module re-exports individual model modules so imports like
//! `use crate::db::models::*;` keep working.

pub mod email_verification;
pub mod execution;
pub mod notification_send;
pub mod task;
pub mod user;
pub mod webhook_delivery;

pub use self::email_verification::*;
pub use self::execution::*;
pub use self::notification_send::*;
pub use self::task::*;
pub use self::user::*;
pub use self::webhook_delivery::*;
