pub mod event;
pub mod plan;
pub mod skymap;
pub mod telescope;
pub mod time;

pub use event::{Event, GcnNotice, NoticeType};
pub use plan::{Plan, PlanArgs, PlanError, PlanStatus, PlannedObservation};
pub use skymap::{HealpixMap, MapError, MapPayload, WORKING_ORDER};
pub use telescope::{
    Field, FieldOfView, FileFormat, Galaxy, SchedulerBackend, Telescope,
};
pub use time::ModifiedJulianDate;
