pub mod subscriber;
pub mod table;

pub use subscriber::{RouteFlags, Subscriber, MH_HR_ROUTE};
pub use table::{Entry, Table};
