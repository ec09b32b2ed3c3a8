//! Inbound command API

pub mod dto;
pub mod handler;
