//! # Call Test Utilities
//!
//! Mocks and fixtures for exercising the call core without real media
//! devices or a real peer-to-peer transport.
//!
//! ## Modules
//!
//! - `mock_peer` - scripted peer connections that emit candidates and
//!   connectivity once both descriptions are set
//! - `mock_media` - media devices that succeed or fail on demand
//! - `fixtures` - memory store with a manual clock, users, seeded rooms
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_test_utils::fixtures::TestStore;
//! use call_test_utils::mock_media::MockMediaDevices;
//! use call_test_utils::mock_peer::MockPeerConnector;
//!
//! let store = TestStore::new();
//! let devices = MockMediaDevices::new();
//! let connector = MockPeerConnector::new().with_local_candidates(3);
//! ```

pub mod fixtures;
pub mod mock_media;
pub mod mock_peer;
