pub mod calendar;
pub mod freebusy;
pub mod ics;
pub mod storage;
pub mod sync;

pub use calendar::{Attendee, Calendar, CalendarEvent, EventStatus, EventTime};
pub use freebusy::{BusyPeriod, FreeSlot, FreeSlotOptions};
pub use sync::{IncrementalFetch, ProviderClient, SyncOrchestrator};
