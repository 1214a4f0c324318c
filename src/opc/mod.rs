/// Open Packaging Conventions (OPC) implementation.
///
/// This module provides the package model used by Office Open XML documents:
///
/// - Package structure (parts, relationships, the relationship graph)
/// - Content type management
/// - ZIP-based physical packaging
/// - Loading a package into parts chosen by content type, and saving it back
///
/// # Performance Features
///
/// - Uses `memchr` for fast string searching in XML
/// - Uses `atoi_simd` for fast rId suffix parsing
/// - Uses `quick-xml` for streaming XML parsing
/// - Parts are addressed by index; relationships never own their targets

pub mod constants;
pub mod error;
pub mod package;
pub mod packuri;
pub mod part;
pub mod phys_pkg;
pub mod pkgreader;
pub mod pkgwriter;
pub mod rel;
pub mod unmarshal;

// Re-export commonly used types
pub use error::{OpcError, Result};
pub use package::{OpcPackage, PackageId};
pub use packuri::PackURI;
pub use part::{BlobPart, LoadPart, Part, PartFactory, PartId, XmlPart};
pub use phys_pkg::{Compression, WriteOptions};
pub use rel::{RelTarget, Relationship, RelationshipCollection, ResolvePart};
