mod repository;

pub use repository::{NewMeeting, Storage};
