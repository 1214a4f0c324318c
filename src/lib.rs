//! ooxml-opc - Open Packaging Conventions package model for Office Open XML files
//!
//! This library reads, models and writes the ZIP-based packages behind .pptx,
//! .docx and .xlsx files: the parts they contain, their content types, and the
//! relationship graph that links parts to each other and to external resources.
//!
//! # Features
//!
//! - **Part graph**: parts addressed by [`PartId`](opc::PartId), relationships
//!   that point at parts or at external URLs
//! - **Relationship IDs**: rIds are reused for equivalent relationships and
//!   allocated past the highest existing suffix
//! - **Pluggable part types**: a [`PartFactory`](opc::PartFactory) picks the
//!   Part implementation for each content type on load
//! - **Round trip**: saved packages reload into the same graph
//!
//! # Example - Walking a presentation
//!
//! ```no_run
//! use ooxml_opc::opc::OpcPackage;
//! use ooxml_opc::opc::constants::relationship_type as rt;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pkg = OpcPackage::open("deck.pptx")?;
//! let presentation = pkg.related_part(rt::OFFICE_DOCUMENT)?;
//! println!("main part: {}", presentation.partname());
//!
//! for part in pkg.iter_parts() {
//!     println!("{} ({})", part.partname(), part.content_type());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Example - Adding a hyperlink and saving
//!
//! ```no_run
//! use ooxml_opc::opc::{OpcPackage, PackURI, RelTarget};
//! use ooxml_opc::opc::constants::relationship_type as rt;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut pkg = OpcPackage::open("deck.pptx")?;
//! let slide = pkg
//!     .find_part(&PackURI::new("/ppt/slides/slide1.xml")?)
//!     .ok_or("no first slide")?;
//!
//! let r_id = pkg
//!     .part_mut(slide)?
//!     .relate_to(RelTarget::External("https://example.com/".into()), rt::HYPERLINK);
//! println!("hyperlink stored as {}", r_id);
//!
//! pkg.save("deck-linked.pptx")?;
//! # Ok(())
//! # }
//! ```

/// Open Packaging Conventions: package, parts, relationships and their serialization.
pub mod opc;
