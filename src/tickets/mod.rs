//! Ticket domain types and human-readable code generation.

pub mod code;
pub mod types;

pub use types::{
    DisplayState, NewTicket, OrderId, ParseEnumError, SyncOutcome, SyncRecord, SyncStatus, Ticket,
    TicketId, TicketStatus, TicketType,
};
