use super::test_helpers::*;
use super::*;
use crate::task::test_helpers::{Gate, Script, eventually};
use crate::types::{Payload, QueueRequest, TaskState};

mod control;
mod queue;
