//! Webhook signature verification for GitHub (HMAC-SHA256) and Terraform
//! Cloud (HMAC-SHA512).

pub mod signature;

pub use signature::{
    compute_signature, compute_tfc_signature, format_signature_header, parse_signature_header,
    verify_signature, verify_tfc_signature,
};
