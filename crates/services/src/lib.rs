//! Application services sitting between the HTTP gateway and the
//! infrastructure seams.

pub mod accounts;
pub mod tasks;

pub use accounts::AccountService;
pub use tasks::TaskService;
