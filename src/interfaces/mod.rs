//! Collaborators the manager depends on but does not implement.

pub mod boot;
pub mod disks;
pub mod sealing;
pub mod snaps;
