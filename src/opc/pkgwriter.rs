//! Package writer for OPC packages.
//!
//! This module serializes a package graph into a ZIP archive: the
//! [Content_Types].xml item, the package relationships, and every part together
//! with its own .rels item.

use crate::opc::constants::content_type as ct;
use crate::opc::error::Result;
use crate::opc::packuri::{CONTENT_TYPES_URI, PackURI};
use crate::opc::part::{Part, PartId};
use crate::opc::phys_pkg::{PhysPkgWriter, WriteOptions};
use crate::opc::rel::{RelationshipCollection, ResolvePart};
use quick_xml::escape::escape;
use std::collections::{BTreeMap, HashMap};
use std::io::{Seek, Write};

/// Extension/content-type pairs written as Default elements rather than Overrides.
const DEFAULT_CONTENT_TYPES: &[(&str, &str)] = &[
    ("bmp", ct::BMP),
    ("emf", ct::X_EMF),
    ("gif", ct::GIF),
    ("jpeg", ct::JPEG),
    ("jpg", ct::JPEG),
    ("png", ct::PNG),
    ("rels", ct::OPC_RELATIONSHIPS),
    ("tif", ct::TIFF),
    ("tiff", ct::TIFF),
    ("wmf", ct::X_WMF),
    ("xml", ct::XML),
];

/// Writes a package graph to a ZIP archive.
///
/// The caller supplies the package relationships and the parts to write, which
/// is every part reachable from those relationships. Relationship targets are
/// resolved against the partnames of the supplied parts.
///
/// # Example
///
/// ```no_run
/// use ooxml_opc::opc::OpcPackage;
///
/// let mut pkg = OpcPackage::open("deck.pptx")?;
/// pkg.save("copy.pptx")?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct PackageWriter;

impl PackageWriter {
    /// Write a package with default options, returning `pkg_file` once the archive is finished.
    pub fn write<W: Write + Seek>(
        pkg_file: W,
        pkg_rels: &RelationshipCollection,
        parts: &[(PartId, &dyn Part)],
    ) -> Result<W> {
        Self::write_with(pkg_file, pkg_rels, parts, WriteOptions::default())
    }

    /// Write a package with explicit archive options.
    pub fn write_with<W: Write + Seek>(
        pkg_file: W,
        pkg_rels: &RelationshipCollection,
        parts: &[(PartId, &dyn Part)],
        options: WriteOptions,
    ) -> Result<W> {
        let partnames: HashMap<PartId, &PackURI> =
            parts.iter().map(|(id, part)| (*id, part.partname())).collect();

        let mut phys_writer = PhysPkgWriter::new(pkg_file, options);
        Self::write_content_types(&mut phys_writer, parts)?;
        Self::write_pkg_rels(&mut phys_writer, pkg_rels, &partnames)?;
        Self::write_parts(&mut phys_writer, parts, &partnames)?;
        phys_writer.finish()
    }

    /// Write the [Content_Types].xml item.
    fn write_content_types<W: Write + Seek>(
        phys_writer: &mut PhysPkgWriter<W>,
        parts: &[(PartId, &dyn Part)],
    ) -> Result<()> {
        let cti = ContentTypesItem::from_parts(parts.iter().map(|(_, part)| *part));
        phys_writer.write(&PackURI::new(CONTENT_TYPES_URI)?, cti.to_xml().as_bytes())
    }

    /// Write the package-level relationships to /_rels/.rels.
    fn write_pkg_rels<W: Write + Seek>(
        phys_writer: &mut PhysPkgWriter<W>,
        pkg_rels: &RelationshipCollection,
        partnames: &dyn ResolvePart,
    ) -> Result<()> {
        let rels_xml = pkg_rels.xml(partnames)?;
        phys_writer.write(&PackURI::package().rels_uri()?, rels_xml.as_bytes())
    }

    /// Write every part, followed by its .rels item when it has relationships.
    ///
    /// A part without a blob is written as an empty member, so the package it is
    /// reachable from can be read back.
    fn write_parts<W: Write + Seek>(
        phys_writer: &mut PhysPkgWriter<W>,
        parts: &[(PartId, &dyn Part)],
        partnames: &dyn ResolvePart,
    ) -> Result<()> {
        for (_, part) in parts {
            if part.blob().is_none() {
                tracing::debug!(
                    partname = %part.partname(),
                    "part has no blob, writing empty member"
                );
            }
            phys_writer.write(part.partname(), part.blob().unwrap_or_default())?;

            if !part.rels().is_empty() {
                let rels_xml = part.rels().xml(partnames)?;
                phys_writer.write(&part.partname().rels_uri()?, rels_xml.as_bytes())?;
            }
        }

        Ok(())
    }
}

/// Builder for the [Content_Types].xml item.
///
/// Keeps Default elements by extension and Override elements by partname, both
/// sorted so the output is stable.
#[derive(Debug)]
struct ContentTypesItem {
    defaults: BTreeMap<String, String>,
    overrides: BTreeMap<String, String>,
}

impl ContentTypesItem {
    fn new() -> Self {
        let mut defaults = BTreeMap::new();
        defaults.insert("rels".to_string(), ct::OPC_RELATIONSHIPS.to_string());
        defaults.insert("xml".to_string(), ct::XML.to_string());

        Self {
            defaults,
            overrides: BTreeMap::new(),
        }
    }

    fn from_parts<'a>(parts: impl Iterator<Item = &'a dyn Part>) -> Self {
        let mut cti = Self::new();
        for part in parts {
            cti.add_content_type(part.partname(), part.content_type());
        }
        cti
    }

    /// Use a Default element when the extension has a well-known content type,
    /// an Override for the partname otherwise.
    fn add_content_type(&mut self, partname: &PackURI, content_type: &str) {
        let ext = partname.ext().to_lowercase();

        if DEFAULT_CONTENT_TYPES.contains(&(ext.as_str(), content_type)) {
            self.defaults.insert(ext, content_type.to_string());
        } else {
            self.overrides
                .insert(partname.to_string(), content_type.to_string());
        }
    }

    fn to_xml(&self) -> String {
        let mut xml = String::with_capacity(4096);

        xml.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        xml.push('\n');
        xml.push_str(
            r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
        );
        xml.push('\n');

        for (ext, content_type) in &self.defaults {
            xml.push_str(&format!(
                r#"  <Default Extension="{}" ContentType="{}"/>"#,
                escape(ext.as_str()),
                escape(content_type.as_str())
            ));
            xml.push('\n');
        }

        for (partname, content_type) in &self.overrides {
            xml.push_str(&format!(
                r#"  <Override PartName="{}" ContentType="{}"/>"#,
                escape(partname.as_str()),
                escape(content_type.as_str())
            ));
            xml.push('\n');
        }

        xml.push_str("</Types>");

        xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opc::constants::relationship_type as rt;
    use crate::opc::part::{BlobPart, XmlPart};
    use crate::opc::phys_pkg::PhysPkgReader;
    use crate::opc::rel::RelTarget;
    use std::io::Cursor;

    fn partname(uri: &str) -> PackURI {
        PackURI::new(uri).unwrap()
    }

    #[test]
    fn test_content_types_xml() {
        let mut cti = ContentTypesItem::new();
        cti.add_content_type(&partname("/ppt/media/image1.PNG"), ct::PNG);
        cti.add_content_type(&partname("/ppt/presentation.xml"), ct::PML_PRESENTATION_MAIN);
        cti.add_content_type(&partname("/docProps/app.xml"), ct::XML);

        let xml = cti.to_xml();

        assert!(xml.contains(r#"<Default Extension="png" ContentType="image/png"/>"#));
        assert!(xml.contains(r#"<Default Extension="xml" ContentType="application/xml"/>"#));
        assert!(xml.contains(r#"<Override PartName="/ppt/presentation.xml""#));
        assert!(!xml.contains("/docProps/app.xml"));
        assert!(xml.find("Extension=\"png\"").unwrap() < xml.find("Extension=\"rels\"").unwrap());
    }

    #[test]
    fn test_unknown_extension_gets_override() {
        let mut cti = ContentTypesItem::new();
        cti.add_content_type(&partname("/ppt/media/media1.mp4"), "video/mp4");
        cti.add_content_type(&partname("/ppt/media/image2.png"), "image/x-png");

        assert_eq!(cti.overrides.len(), 2);
        assert!(!cti.defaults.contains_key("mp4"));
    }

    #[test]
    fn test_write_package() {
        let mut pres = XmlPart::new(
            partname("/ppt/presentation.xml"),
            ct::PML_PRESENTATION_MAIN.to_string(),
            b"<p:presentation/>".to_vec(),
            None,
        );
        let image = BlobPart::new(
            partname("/ppt/media/image1.png"),
            ct::PNG.to_string(),
            Some(vec![0x89, 0x50]),
            None,
        );
        let pres_id = PartId::new(0);
        let image_id = PartId::new(1);
        pres.relate_to(RelTarget::Internal(image_id), rt::IMAGE);

        let mut pkg_rels = RelationshipCollection::new("/");
        pkg_rels.get_or_add(rt::OFFICE_DOCUMENT, pres_id);

        let parts: Vec<(PartId, &dyn Part)> =
            vec![(pres_id, &pres as &dyn Part), (image_id, &image as &dyn Part)];
        let bytes = PackageWriter::write(Cursor::new(Vec::new()), &pkg_rels, &parts)
            .unwrap()
            .into_inner();

        let mut reader = PhysPkgReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.len(), 5);
        assert_eq!(
            reader.blob_for(&partname("/ppt/media/image1.png")).unwrap(),
            vec![0x89, 0x50]
        );

        let pkg_rels_xml = reader.rels_xml_for(&PackURI::package()).unwrap().unwrap();
        let pkg_rels_xml = String::from_utf8(pkg_rels_xml).unwrap();
        assert!(pkg_rels_xml.contains(r#"Target="ppt/presentation.xml""#));

        let pres_rels_xml = reader
            .rels_xml_for(&partname("/ppt/presentation.xml"))
            .unwrap()
            .unwrap();
        let pres_rels_xml = String::from_utf8(pres_rels_xml).unwrap();
        assert!(pres_rels_xml.contains(r#"Target="media/image1.png""#));

        assert!(!reader.contains(&partname("/ppt/media/_rels/image1.png.rels")));
    }

    #[test]
    fn test_part_without_blob_is_written_empty() {
        let generated = BlobPart::new(partname("/ppt/gen.xml"), ct::XML.to_string(), None, None);
        let gen_id = PartId::new(0);
        let mut pkg_rels = RelationshipCollection::new("/");
        pkg_rels.get_or_add(rt::OFFICE_DOCUMENT, gen_id);

        let parts: Vec<(PartId, &dyn Part)> = vec![(gen_id, &generated as &dyn Part)];
        let bytes = PackageWriter::write(Cursor::new(Vec::new()), &pkg_rels, &parts)
            .unwrap()
            .into_inner();

        let mut reader = PhysPkgReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.contains(&partname("/ppt/gen.xml")));
        assert!(reader.blob_for(&partname("/ppt/gen.xml")).unwrap().is_empty());
    }

    #[test]
    fn test_dangling_target_fails_write() {
        let mut pkg_rels = RelationshipCollection::new("/");
        pkg_rels.get_or_add(rt::OFFICE_DOCUMENT, PartId::new(3));

        let result = PackageWriter::write(Cursor::new(Vec::new()), &pkg_rels, &[]);
        assert!(result.is_err());
    }
}
