//! The request model.
//!
//! A request is an owned value that travels through the pipeline: triage
//! queue, zone queue, and possibly a parking spot inside the page cache
//! while a chapter page is read from disk. Every request completes exactly
//! once through the index callback with its `status` and `location` filled
//! in; a parked request is owned by the I/O subsystem until the read
//! finishes and the restarter re-enqueues it.

use crate::error::Result;
use crate::record::{RecordData, RecordName};

/// The kinds of deduplication requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Add a new record, or return the existing one.
    Post,
    /// Look up a record and refresh its chapter if found.
    Query,
    /// Look up a record without updating anything.
    QueryNoUpdate,
    /// Overwrite a record's data.
    Update,
    /// Remove a record.
    Delete,
}

/// Where a record was found, recorded on the request for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Location {
    /// The record is in the open chapter.
    OpenChapter,
    /// The record is in a dense on-disk chapter.
    Dense,
    /// The record is in a sparse chapter reached through the sparse cache.
    Sparse,
    /// A chapter index probe has resolved the record page; only the record
    /// page search remains. Used to resume a parked request without
    /// repeating the chapter index search.
    RecordPageLookup,
    /// The record could not be found or the search could not complete.
    Unavailable,
    /// The search has not located the record yet.
    #[default]
    Unknown,
}

/// Control messages passed between zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMessage {
    /// Rendezvous before changing sparse cache membership.
    SparseCacheBarrier(u64),
    /// Another zone has closed this chapter; close ours too.
    AnnounceChapterClosed(u64),
}

/// Pipeline stages a request can be enqueued at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The pre-zone stage where sparse cache barriers originate.
    Triage,
    /// Zone assignment and the per-zone pipeline.
    Index,
    /// Control messages already addressed to a zone.
    Message,
}

/// A deduplication request.
#[derive(Debug)]
pub struct Request {
    /// The operation to perform.
    pub kind: RequestType,
    /// The record name to operate on.
    pub name: RecordName,
    /// Data to store for Post and Update requests.
    pub new_data: RecordData,
    /// Data previously stored under this name, filled in on a match.
    pub old_data: RecordData,
    /// The zone this request is assigned to.
    pub zone_number: u32,
    /// The chapter the volume index believes holds this name.
    pub virtual_chapter: u64,
    /// The record page resolved by a chapter index probe.
    pub record_page_number: u32,
    /// Whether the record was found.
    pub found: bool,
    /// Whether this request has been restarted after a parked page read.
    pub requeued: bool,
    /// The completion status.
    pub status: Result<()>,
    /// Where the record was located.
    pub location: Location,
    /// Control message payload; set only for zone messages.
    pub message: Option<ZoneMessage>,
}

impl Request {
    /// Creates a data request.
    pub fn new(kind: RequestType, name: RecordName) -> Self {
        Self {
            kind,
            name,
            new_data: RecordData::default(),
            old_data: RecordData::default(),
            zone_number: 0,
            virtual_chapter: 0,
            record_page_number: 0,
            found: false,
            requeued: false,
            status: Ok(()),
            location: Location::Unknown,
            message: None,
        }
    }

    /// Creates a data request carrying a payload to store.
    pub fn with_data(kind: RequestType, name: RecordName, data: RecordData) -> Self {
        let mut request = Self::new(kind, name);
        request.new_data = data;
        request
    }

    /// Creates a zone control message addressed to the given zone.
    pub fn message(message: ZoneMessage, zone_number: u32) -> Self {
        let mut request = Self::new(RequestType::Query, RecordName([0; 32]));
        request.zone_number = zone_number;
        request.message = Some(message);
        request
    }

    /// Sets the location and the derived found flag.
    pub fn set_location(&mut self, location: Location) {
        self.location = location;
        self.found = matches!(
            location,
            Location::OpenChapter | Location::Dense | Location::Sparse
        );
    }
}
