//! Asset Administration Shell (AAS) discovery.
//!
//! ```text
//! aas/
//! ├── client.rs    - HTTP client, id encoding, submodel element path search
//! └── provider.rs  - AasProvider trait + CachingAasProvider for the tree
//! ```

pub mod client;
pub mod provider;

pub use client::AasClient;
pub use provider::{AasClientProvider, AasProvider, CachingAasProvider};
