//! Service layer for the follow-up pipeline.
//!
//! Services sit between the repository and the HTTP surface: map
//! acquisition, contour extraction, plan generation, backend submission,
//! and the background orchestration that ties them to incoming notices.

pub mod acquisition;
pub mod contour;
pub mod job_tracker;
pub mod pipeline;
pub mod roster;
pub mod submission;
pub mod tiler;

pub use acquisition::{AcquisitionError, FetchPolicy, MapAcquisition};
pub use contour::compute_contour;
pub use job_tracker::{JobStatus, JobTracker, LogLevel};
pub use roster::load_tessellations;
pub use submission::{export_plan, submit_plan, SubmissionError};
pub use tiler::{
    generate_plan, GreedyAllocator, PlanGenerationError, PlanRequest, TileAllocator,
};
