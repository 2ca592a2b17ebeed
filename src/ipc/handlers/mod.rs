pub mod completion;
pub mod core;
pub mod helpers;
pub mod lessons;
pub mod reminders;
pub mod stats;
pub mod students;
pub mod subjects;
pub mod subscriptions;
