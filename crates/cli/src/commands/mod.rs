pub mod bridge;
pub mod checkpoints;
pub mod history;
pub mod onboard;
pub mod run;
