//! Deposit Service
//!
//! Image deposit pipeline for the e-waste classification platform. The
//! service accepts an uploaded image, stores it in an S3-compatible blob
//! store (Cloudflare R2), records a pending transaction in a PostgREST-style
//! relational store, and returns a signed URL usable by the downstream ML
//! classifier.
//!
//! The two external writes are independent and non-transactional; the
//! pipeline makes them appear atomic to the caller through ordering and
//! best-effort compensation: storage first, record last, and any failure
//! after the upload deletes the uploaded object before the error is
//! surfaced.
//!
//! ## Architecture
//!
//! ```text
//! Identity layer            Blob store (R2)          Record store (PostgREST)
//! ┌──────────────┐          ┌──────────────┐          ┌──────────────┐
//! │ verified     │          │ deposits/    │          │ users        │
//! │ external id  │          │   {owner}/   │          │ transactions │
//! └──────┬───────┘          │   {uuid}.ext │          └──────▲───────┘
//!        │                  └──────▲───────┘                 │
//!        ▼                         │ 1. upload               │ 2. resolve user
//! ┌──────────────┐                 │    (+ delete on         │ 3. insert pending
//! │ Deposit      │─────────────────┴──── compensation) ──────┘    transaction
//! │ Pipeline     │
//! └──────────────┘
//! ```

pub mod api;
pub mod blob_store;
pub mod config;
pub mod deposit;
pub mod record_store;

pub use blob_store::{BlobStore, BlobStoreError, S3BlobStore, StoredObject};
pub use config::Config;
pub use deposit::{DepositError, DepositOutcome, DepositPipeline, DepositRequest};
pub use record_store::{
    PostgrestRecordStore, RecordStore, RecordStoreError, TransactionRecord, TransactionStatus,
    TransactionUpdate, User,
};
