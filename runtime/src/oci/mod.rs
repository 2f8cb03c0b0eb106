//! OCI image support.
//!
//! Image references, the local image store, registry pulls, base image
//! resolution, and reading/writing OCI image layouts.
//!
//! # Layout
//!
//! ```text
//! image/
//! ├── oci-layout           (OCI layout marker)
//! ├── index.json           (Image index)
//! └── blobs/
//!     └── sha256/
//!         ├── <manifest>   (Image manifest)
//!         ├── <config>     (Image configuration)
//!         └── <layers>     (Filesystem layers, tar+gzip)
//! ```

mod image;
pub mod layers;
pub mod layout;
pub mod reference;
pub mod registry;
pub mod resolve;
pub mod store;

pub use image::{HistoryRecord, ImageLayer, OciImage, OciImageConfig};
pub use layers::extract_layer;
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryPuller};
pub use resolve::{BaseImage, BaseImageResolver, StoreResolver};
pub use store::{ImageSource, ImageStore, StoredImage};
