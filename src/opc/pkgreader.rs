//! Low-level, read-only API to a serialized Open Packaging Convention (OPC) package.
//!
//! This module provides the PackageReader for parsing OPC packages: content type
//! mapping, .rels parsing, and the walk of the relationship graph that decides
//! which archive members are parts.

use crate::opc::constants::target_mode;
use crate::opc::error::{OpcError, Result};
use crate::opc::packuri::PackURI;
use crate::opc::phys_pkg::PhysPkgReader;
use quick_xml::Reader;
use quick_xml::events::Event;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};

/// Serialized part as loaded from the physical package, before it becomes a Part.
#[derive(Debug, Clone)]
pub struct SerializedPart {
    /// The partname (URI) of this part
    pub partname: PackURI,

    /// The content type of this part
    pub content_type: String,

    /// The relationship type that first reached this part
    pub reltype: String,

    /// The binary content of this part
    pub blob: Vec<u8>,
}

/// Serialized relationship as read from a .rels file.
///
/// Contains all relationship information in string form, before
/// being converted into Relationship objects with resolved part references.
#[derive(Debug, Clone)]
pub struct SerializedRelationship {
    /// Base URI for resolving relative references
    pub base_uri: String,

    /// Relationship ID (e.g., "rId1")
    pub r_id: String,

    /// Relationship type URI
    pub reltype: String,

    /// Target reference (relative URI or external URL)
    pub target_ref: String,

    /// Target mode (Internal or External)
    pub target_mode: String,
}

impl SerializedRelationship {
    /// Check if this is an external relationship.
    #[inline]
    pub fn is_external(&self) -> bool {
        self.target_mode == target_mode::EXTERNAL
    }

    /// Get the target partname for internal relationships.
    ///
    /// Resolves the relative target reference against the base URI
    /// to produce an absolute PackURI.
    pub fn target_partname(&self) -> Result<PackURI> {
        if self.is_external() {
            return Err(OpcError::InvalidRelationship(format!(
                "Cannot get target_partname for external relationship '{}'",
                self.r_id
            )));
        }
        PackURI::from_rel_ref(&self.base_uri, &self.target_ref)
    }
}

/// Source of serialized parts and relationships for the unmarshaller.
///
/// [`PackageReader`] is the zip-backed implementation.
pub trait PackageSource {
    /// Hand over every serialized part. Parts are yielded once; a second call yields nothing.
    fn iter_sparts(&mut self) -> impl Iterator<Item = SerializedPart> + '_;

    /// Every serialized relationship paired with the partname of its source.
    ///
    /// Package-level relationships have the source "/".
    fn iter_srels(&self) -> impl Iterator<Item = (&PackURI, &SerializedRelationship)> + '_;
}

/// Content type map for looking up content types by part name or extension.
///
/// Implements the OPC content type discovery algorithm using Default and Override
/// elements from [Content_Types].xml.
#[derive(Debug, Default)]
struct ContentTypeMap {
    /// Maps lowercase file extensions to default content types
    defaults: HashMap<String, String>,

    /// Maps lowercase partnames to override content types
    overrides: HashMap<String, String>,
}

impl ContentTypeMap {
    /// Parse content types from [Content_Types].xml.
    fn from_xml(xml: &[u8]) -> Result<Self> {
        let mut map = Self::default();
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e)) => {
                    let entry: Option<(&[u8], bool)> = match e.local_name().as_ref() {
                        b"Default" => Some((&b"Extension"[..], true)),
                        b"Override" => Some((&b"PartName"[..], false)),
                        _ => None,
                    };
                    if let Some((key_attr, is_default)) = entry {
                        let mut key = None;
                        let mut content_type = None;
                        for attr in e.attributes() {
                            let attr = attr?;
                            if attr.key.as_ref() == key_attr {
                                key = Some(attr.unescape_value()?.to_lowercase());
                            } else if attr.key.as_ref() == b"ContentType" {
                                content_type = Some(attr.unescape_value()?.to_string());
                            }
                        }

                        match (key, content_type) {
                            (Some(ext), Some(ct)) if is_default => {
                                map.defaults.insert(ext, ct);
                            },
                            (Some(partname), Some(ct)) => {
                                map.overrides.insert(partname, ct);
                            },
                            _ => {
                                tracing::warn!("skipping incomplete content type entry");
                            },
                        }
                    }
                },
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(OpcError::XmlError(format!("Content types parse error: {}", e)));
                },
                _ => {},
            }
            buf.clear();
        }

        Ok(map)
    }

    /// Get the content type for a partname.
    ///
    /// Overrides win over extension defaults; both lookups ignore case.
    fn get(&self, pack_uri: &PackURI) -> Result<String> {
        if let Some(ct) = self.overrides.get(&pack_uri.as_str().to_lowercase()) {
            return Ok(ct.clone());
        }

        if let Some(ct) = self.defaults.get(&pack_uri.ext().to_lowercase()) {
            return Ok(ct.clone());
        }

        Err(OpcError::ContentTypeNotFound(pack_uri.to_string()))
    }
}

/// Package reader that provides access to serialized parts and relationships.
///
/// Only members reachable from the package relationships are read as parts;
/// anything else in the archive is ignored.
#[derive(Debug, Default)]
pub struct PackageReader {
    /// All serialized parts, in the order the graph walk found them
    sparts: Vec<SerializedPart>,

    /// Every relationship, keyed by the partname of its source
    srels: Vec<(PackURI, SerializedRelationship)>,
}

impl PackageReader {
    /// Read a package through a physical reader.
    ///
    /// Walks the relationship graph from the package-level relationships, reading
    /// each internal target once. A target missing from the archive is an error.
    pub fn from_phys_reader<R: Read + Seek>(phys_reader: &mut PhysPkgReader<R>) -> Result<Self> {
        let content_types = ContentTypeMap::from_xml(&phys_reader.content_types_xml()?)?;

        let mut reader = Self::default();
        let mut visited: HashSet<PackURI> = HashSet::new();
        let mut work_queue: Vec<(PackURI, String)> = Vec::new();

        reader.push_srels(phys_reader, PackURI::package(), &mut visited, &mut work_queue)?;

        // Stack-based walk; reversed pushes keep parts in relationship order.
        while let Some((partname, reltype)) = work_queue.pop() {
            reader.push_srels(phys_reader, partname.clone(), &mut visited, &mut work_queue)?;

            let blob = phys_reader.blob_for(&partname)?;
            let content_type = content_types.get(&partname)?;
            tracing::trace!(partname = %partname, content_type = %content_type, "read part");

            reader.sparts.push(SerializedPart {
                partname,
                content_type,
                reltype,
                blob,
            });
        }

        tracing::debug!(
            parts = reader.sparts.len(),
            rels = reader.srels.len(),
            "read package"
        );
        Ok(reader)
    }

    /// Record the relationships of `source` and queue its unseen internal targets.
    fn push_srels<R: Read + Seek>(
        &mut self,
        phys_reader: &mut PhysPkgReader<R>,
        source: PackURI,
        visited: &mut HashSet<PackURI>,
        work_queue: &mut Vec<(PackURI, String)>,
    ) -> Result<()> {
        let srels = match phys_reader.rels_xml_for(&source)? {
            Some(xml) => Self::parse_rels_xml(&xml, source.base_uri())?,
            None => SmallVec::new(),
        };

        let mut targets = Vec::new();
        for srel in &srels {
            if srel.is_external() {
                continue;
            }
            let partname = srel.target_partname()?;
            if visited.insert(partname.clone()) {
                targets.push((partname, srel.reltype.clone()));
            }
        }
        work_queue.extend(targets.into_iter().rev());

        self.srels
            .extend(srels.into_iter().map(|srel| (source.clone(), srel)));
        Ok(())
    }

    /// Parse relationships XML into SerializedRelationship structs.
    fn parse_rels_xml(
        rels_xml: &[u8],
        base_uri: &str,
    ) -> Result<SmallVec<[SerializedRelationship; 8]>> {
        let mut srels = SmallVec::new();
        let mut reader = Reader::from_reader(rels_xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e)) => {
                    if e.local_name().as_ref() == b"Relationship" {
                        let mut r_id = None;
                        let mut reltype = None;
                        let mut target_ref = None;
                        let mut target_mode = target_mode::INTERNAL.to_string();

                        for attr in e.attributes() {
                            let attr = attr?;
                            match attr.key.as_ref() {
                                b"Id" => r_id = Some(attr.unescape_value()?.to_string()),
                                b"Type" => reltype = Some(attr.unescape_value()?.to_string()),
                                b"Target" => target_ref = Some(attr.unescape_value()?.to_string()),
                                b"TargetMode" => target_mode = attr.unescape_value()?.to_string(),
                                _ => {},
                            }
                        }

                        match (r_id, reltype, target_ref) {
                            (Some(r_id), Some(reltype), Some(target_ref)) => {
                                srels.push(SerializedRelationship {
                                    base_uri: base_uri.to_string(),
                                    r_id,
                                    reltype,
                                    target_ref,
                                    target_mode,
                                });
                            },
                            (r_id, _, _) => {
                                return Err(OpcError::InvalidRelationship(format!(
                                    "Relationship {} under '{}' is missing Id, Type or Target",
                                    r_id.as_deref().unwrap_or("<no Id>"),
                                    base_uri
                                )));
                            },
                        }
                    }
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(OpcError::XmlError(format!("Rels parse error: {}", e))),
                _ => {},
            }
            buf.clear();
        }

        Ok(srels)
    }

    /// Serialized parts not yet handed out.
    pub fn sparts(&self) -> &[SerializedPart] {
        &self.sparts
    }
}

impl PackageSource for PackageReader {
    fn iter_sparts(&mut self) -> impl Iterator<Item = SerializedPart> + '_ {
        self.sparts.drain(..)
    }

    fn iter_srels(&self) -> impl Iterator<Item = (&PackURI, &SerializedRelationship)> + '_ {
        self.srels.iter().map(|(source, srel)| (source, srel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opc::phys_pkg::{PhysPkgWriter, WriteOptions};
    use std::io::Cursor;

    const CONTENT_TYPES: &[u8] = br#"<?xml version="1.0"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
    <Default Extension="xml" ContentType="application/xml"/>
    <Default Extension="PNG" ContentType="image/png"/>
    <Override PartName="/ppt/presentation.xml" ContentType="application/vnd.openxmlformats-officedocument.presentationml.presentation.main+xml"/>
</Types>"#;

    fn build_package(members: &[(&str, &[u8])]) -> PhysPkgReader<Cursor<Vec<u8>>> {
        let mut writer = PhysPkgWriter::new(Cursor::new(Vec::new()), WriteOptions::default());
        for (uri, blob) in members {
            writer.write(&PackURI::new(*uri).unwrap(), blob).unwrap();
        }
        PhysPkgReader::new(Cursor::new(writer.finish().unwrap().into_inner())).unwrap()
    }

    fn rels_xml(rels: &[(&str, &str, &str, bool)]) -> Vec<u8> {
        let mut xml = String::from(
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
        );
        for (r_id, reltype, target, external) in rels {
            xml.push_str(&format!(
                r#"<Relationship Id="{r_id}" Type="{reltype}" Target="{target}""#
            ));
            if *external {
                xml.push_str(r#" TargetMode="External""#);
            }
            xml.push_str("/>");
        }
        xml.push_str("</Relationships>");
        xml.into_bytes()
    }

    #[test]
    fn test_content_type_map() {
        let ct_map = ContentTypeMap::from_xml(CONTENT_TYPES).unwrap();

        let uri = PackURI::new("/test.xml").unwrap();
        assert_eq!(ct_map.get(&uri).unwrap(), "application/xml");

        let uri = PackURI::new("/ppt/presentation.xml").unwrap();
        assert_eq!(
            ct_map.get(&uri).unwrap(),
            "application/vnd.openxmlformats-officedocument.presentationml.presentation.main+xml"
        );

        let uri = PackURI::new("/ppt/media/image1.Png").unwrap();
        assert_eq!(ct_map.get(&uri).unwrap(), "image/png");

        let uri = PackURI::new("/ppt/media/movie.mp4").unwrap();
        assert!(matches!(ct_map.get(&uri), Err(OpcError::ContentTypeNotFound(_))));
    }

    #[test]
    fn test_parse_rels_xml() {
        let xml = rels_xml(&[
            ("rId1", "http://rel/slide", "slides/slide1.xml", false),
            ("rId2", "http://rel/hyperlink", "https://example.com/?a=1&amp;b=2", true),
        ]);
        let srels = PackageReader::parse_rels_xml(&xml, "/ppt").unwrap();

        assert_eq!(srels.len(), 2);
        assert_eq!(srels[0].target_partname().unwrap().as_str(), "/ppt/slides/slide1.xml");
        assert!(!srels[0].is_external());
        assert!(srels[1].is_external());
        assert_eq!(srels[1].target_ref, "https://example.com/?a=1&b=2");
        assert!(matches!(
            srels[1].target_partname(),
            Err(OpcError::InvalidRelationship(_))
        ));
    }

    #[test]
    fn test_parse_rels_xml_rejects_incomplete_relationship() {
        let xml = br#"<Relationships><Relationship Id="rId1" Target="a.xml"/></Relationships>"#;
        assert!(matches!(
            PackageReader::parse_rels_xml(xml, "/"),
            Err(OpcError::InvalidRelationship(_))
        ));
    }

    #[test]
    fn test_reads_reachable_parts_once() {
        let pkg_rels = rels_xml(&[
            ("rId1", "http://rel/doc", "ppt/presentation.xml", false),
            ("rId2", "http://rel/link", "https://example.com/", true),
        ]);
        let pres_rels = rels_xml(&[
            ("rId1", "http://rel/image", "media/image1.png", false),
            ("rId2", "http://rel/self", "presentation.xml", false),
            ("rId3", "http://rel/image", "media/image1.png", false),
        ]);
        let mut phys_reader = build_package(&[
            ("/[Content_Types].xml", CONTENT_TYPES),
            ("/_rels/.rels", &pkg_rels[..]),
            ("/ppt/presentation.xml", &b"<p:presentation/>"[..]),
            ("/ppt/_rels/presentation.xml.rels", &pres_rels[..]),
            ("/ppt/media/image1.png", &b"PNG"[..]),
            ("/ppt/unreferenced.xml", &b"<orphan/>"[..]),
        ]);

        let mut reader = PackageReader::from_phys_reader(&mut phys_reader).unwrap();

        let partnames: Vec<&str> = reader.sparts().iter().map(|s| s.partname.as_str()).collect();
        assert_eq!(partnames, vec!["/ppt/presentation.xml", "/ppt/media/image1.png"]);
        assert_eq!(reader.sparts()[0].reltype, "http://rel/doc");
        assert_eq!(reader.sparts()[1].content_type, "image/png");

        let srels: Vec<(&str, &str)> = reader
            .iter_srels()
            .map(|(source, srel)| (source.as_str(), srel.r_id.as_str()))
            .collect();
        assert_eq!(
            srels,
            vec![
                ("/", "rId1"),
                ("/", "rId2"),
                ("/ppt/presentation.xml", "rId1"),
                ("/ppt/presentation.xml", "rId2"),
                ("/ppt/presentation.xml", "rId3"),
            ]
        );

        assert_eq!(reader.iter_sparts().count(), 2);
        assert_eq!(reader.iter_sparts().count(), 0);
    }

    #[test]
    fn test_missing_target_is_an_error() {
        let pkg_rels = rels_xml(&[("rId1", "http://rel/doc", "ppt/presentation.xml", false)]);
        let mut phys_reader = build_package(&[
            ("/[Content_Types].xml", CONTENT_TYPES),
            ("/_rels/.rels", &pkg_rels[..]),
        ]);

        assert!(matches!(
            PackageReader::from_phys_reader(&mut phys_reader),
            Err(OpcError::PartNotFound(_))
        ));
    }

    #[test]
    fn test_missing_content_types_is_an_error() {
        let mut phys_reader = build_package(&[("/_rels/.rels", &b"<Relationships/>"[..])]);
        assert!(matches!(
            PackageReader::from_phys_reader(&mut phys_reader),
            Err(OpcError::PartNotFound(_))
        ));
    }
}
