//! Integration tests across the supervisor stack: real child processes,
//! real sockets, real teardown.

mod helpers;
mod monitoring;
mod sequencing;
mod termination;
