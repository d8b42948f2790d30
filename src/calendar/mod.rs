pub mod calendar_type;
pub mod event;
pub mod ident;

pub use calendar_type::{AccessRole, Calendar};
pub use event::{Attendee, CalendarEvent, EventStatus, EventTime, ResponseStatus};
