//! Federation engine
//!
//! Handles:
//! - Activity normalization (inbox, outbox harvest)
//! - Activity delivery and the retry queue
//! - Content filters
//! - HTTP Signatures
//! - WebFinger
//! - Actor box and public key resolution
//! - Attachment mirroring and backtrack records

mod activity;
mod box_resolver;
mod delivery;
mod filter;
mod key_cache;
mod media;
mod signature;
mod single_flight;
mod tracker;
mod transport;
mod webfinger;

pub use activity::{
    ActivityArchive, ConversationHint, HARVEST_LIMIT, MAX_CONTENT_CHARS, MAX_DEPTH,
    MAX_MIRRORED_ATTACHMENTS, Normalizer,
};
pub use box_resolver::{ActorBoxes, ActorDocument, BoxResolver};
pub use delivery::{DeliveryEngine, DeliveryOutcome, MAX_TRIES, backoff, builder, next_attempt};
pub use filter::{
    Classification, CompiledFilter, FilterAction, FilterEngine, FilterHit, MatchCause, TextField,
    UserFilters, matches,
};
pub use key_cache::{KEY_FACT_MAX_AGE, KeyEntry, KeyLookup, KeyResolver, PublicKeyEntry, extract_public_key};
pub use media::{
    ImageTranscoder, MAX_TEXT_ATTACHMENT_BYTES, MediaMirror, PassthroughTranscoder, RemoteMedia,
    Transcoded, content_hash,
};
pub use signature::{
    SignatureError, VerifiedSender, extract_signature_key_id, generate_digest, generate_keypair,
    is_activity_content_type, parse_signature_header, sign_request, verify_inbound,
    verify_signature,
};
pub use single_flight::SingleFlight;
pub use tracker::{TRACK_FLUSH_INTERVAL, Tracker, TrackerHandle};
pub use transport::{
    ACTIVITY_ACCEPT, HttpTransport, JRD_ACCEPT, LD_CONTENT_TYPE, SigningIdentity, Transport,
    TransportError, fetch_hard_mode,
};
pub use webfinger::{
    WebFingerLink, WebFingerResponse, generate_webfinger_response, parse_handle, resolve_webfinger,
};
