//! Audio plumbing: inbound frame decode and outbound paced egress.

pub mod codec;
pub mod egress;
pub mod ingress;
