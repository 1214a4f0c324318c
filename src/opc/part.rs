use crate::opc::constants::{content_type as ct, namespace};
use crate::opc::error::{OpcError, Result};
use crate::opc::package::PackageId;
use crate::opc::packuri::PackURI;
use crate::opc::rel::{RelTarget, Relationship, RelationshipCollection, ResolvePart};
use memchr::memmem;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::{NsReader, Reader};
/// Open Packaging Convention (OPC) objects related to package parts.
///
/// This module provides the Part trait, the BlobPart and XmlPart implementations,
/// and the PartFactory registry that picks a part type by content type while
/// a package is loaded.
use std::collections::{BTreeMap, HashMap};

/// Handle to a part stored in an [`OpcPackage`](crate::opc::OpcPackage).
///
/// Relationships refer to their internal targets by `PartId`, never by
/// owning pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartId(usize);

impl PartId {
    #[inline]
    pub(crate) fn new(index: usize) -> Self {
        PartId(index)
    }

    /// Position of the part in its package's storage.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Trait representing a part in an OPC package.
///
/// Parts are the fundamental units of content in an OPC package. Each part
/// has a partname (PackURI), a content type, an optional payload and its own
/// collection of relationships to other parts or to external resources.
pub trait Part: std::fmt::Debug {
    /// Get the partname of this part.
    fn partname(&self) -> &PackURI;

    /// Rename the part.
    ///
    /// Implementations rebase their relationship collection onto the new
    /// directory so relative targets stay correct.
    fn set_partname(&mut self, partname: PackURI);

    /// Get the content type of this part.
    fn content_type(&self) -> &str;

    /// Get the binary content of this part, if it has any.
    fn blob(&self) -> Option<&[u8]>;

    /// The package this part was loaded into or added to.
    fn package(&self) -> Option<PackageId>;

    fn set_package(&mut self, package: Option<PackageId>);

    /// Get the relationships for this part.
    fn rels(&self) -> &RelationshipCollection;

    /// Get mutable access to the relationships for this part.
    fn rels_mut(&mut self) -> &mut RelationshipCollection;

    /// Called once the whole package graph has been loaded and wired.
    fn after_unmarshal(&mut self) {}

    /// Called on every reachable part right before the package is written.
    ///
    /// Parts that keep a live model of their content refresh their blob here.
    fn before_marshal(&mut self) {}

    /// Record a relationship read back from a serialized package.
    ///
    /// Bypasses the get-or-add reuse logic; the rId is taken as persisted.
    fn load_rel(&mut self, reltype: &str, target: RelTarget, r_id: &str) -> &Relationship {
        self.rels_mut().add_relationship(reltype, target, r_id)
    }

    /// Add or get a relationship to `target` and return its rId.
    ///
    /// Internal targets reuse a relationship with the same reltype and part;
    /// external targets reuse one with the same reltype and URL.
    fn relate_to(&mut self, target: RelTarget, reltype: &str) -> String {
        match target {
            RelTarget::Internal(part) => {
                self.rels_mut().get_or_add(reltype, part).r_id().to_string()
            },
            RelTarget::External(url) => self.rels_mut().get_or_add_ext_rel(reltype, &url),
        }
    }

    /// Get the part this part is related to by `reltype`.
    fn part_related_by(&self, reltype: &str) -> Result<PartId> {
        self.rels().part_with_reltype(reltype)
    }

    /// Get the target reference for a relationship ID.
    ///
    /// Mostly used for hyperlink URLs referenced from the part's own markup.
    fn target_ref(&self, r_id: &str, parts: &dyn ResolvePart) -> Result<String> {
        self.rels().rel(r_id)?.target_ref(parts)
    }

    /// Count `r:id` references to a relationship ID in the part content.
    ///
    /// Byte-level search over the blob; 0 for parts without content.
    fn rel_ref_count(&self, r_id: &str) -> usize {
        let Some(blob) = self.blob() else {
            return 0;
        };
        let pattern = format!(r#"r:id="{}""#, r_id);
        memmem::find_iter(blob, pattern.as_bytes()).count()
    }

    /// Drop the relationship `r_id` unless it is still referenced elsewhere.
    ///
    /// Meant to be called while removing one reference from the markup: with
    /// two or more references the relationship stays, with one or none it is
    /// removed and returned.
    fn drop_rel(&mut self, r_id: &str) -> Option<Relationship> {
        let count = self.rel_ref_count(r_id);
        if count >= 2 {
            tracing::trace!(
                r_id,
                count,
                partname = %self.partname(),
                "relationship still referenced"
            );
            return None;
        }
        tracing::trace!(r_id, partname = %self.partname(), "dropping relationship");
        self.rels_mut().remove(r_id)
    }
}

/// A part type the [`PartFactory`] can construct while loading a package.
pub trait LoadPart: Part + Sized + 'static {
    /// Build the part from its serialized form. No I/O is performed.
    fn load(
        partname: PackURI,
        content_type: String,
        package: Option<PackageId>,
        blob: Vec<u8>,
    ) -> Result<Self>;
}

/// A basic implementation of a Part that stores binary content.
///
/// This is the default part type for non-XML content such as images.
#[derive(Debug)]
pub struct BlobPart {
    partname: PackURI,
    content_type: String,
    package: Option<PackageId>,
    blob: Option<Vec<u8>>,
    rels: RelationshipCollection,
}

impl BlobPart {
    /// Create a new BlobPart.
    ///
    /// # Arguments
    /// * `partname` - The partname (URI) of this part
    /// * `content_type` - The content type of this part
    /// * `blob` - The binary content, absent for generated parts
    /// * `package` - The owning package, if already known
    pub fn new(
        partname: PackURI,
        content_type: String,
        blob: Option<Vec<u8>>,
        package: Option<PackageId>,
    ) -> Self {
        let rels = RelationshipCollection::new(partname.base_uri());
        Self {
            partname,
            content_type,
            package,
            blob,
            rels,
        }
    }

    /// Replace the binary content.
    pub fn set_blob(&mut self, blob: Vec<u8>) {
        self.blob = Some(blob);
    }
}

impl LoadPart for BlobPart {
    fn load(
        partname: PackURI,
        content_type: String,
        package: Option<PackageId>,
        blob: Vec<u8>,
    ) -> Result<Self> {
        Ok(Self::new(partname, content_type, Some(blob), package))
    }
}

impl Part for BlobPart {
    fn partname(&self) -> &PackURI {
        &self.partname
    }

    fn set_partname(&mut self, partname: PackURI) {
        self.rels.rebase(partname.base_uri());
        self.partname = partname;
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn blob(&self) -> Option<&[u8]> {
        self.blob.as_deref()
    }

    fn package(&self) -> Option<PackageId> {
        self.package
    }

    fn set_package(&mut self, package: Option<PackageId>) {
        self.package = package;
    }

    fn rels(&self) -> &RelationshipCollection {
        &self.rels
    }

    fn rels_mut(&mut self) -> &mut RelationshipCollection {
        &mut self.rels
    }
}

/// An XML part that provides parsed access to its XML content.
///
/// The serialized XML is kept as bytes. Replacement markup set through
/// [`XmlPart::set_xml`] is served immediately by every accessor and folded
/// back into the serialized bytes by `before_marshal`.
#[derive(Debug)]
pub struct XmlPart {
    partname: PackURI,
    content_type: String,
    package: Option<PackageId>,

    /// The XML content as raw bytes (UTF-8 encoded)
    xml_bytes: Vec<u8>,

    /// Edited markup not yet folded into `xml_bytes`
    pending: Option<String>,

    rels: RelationshipCollection,
}

impl XmlPart {
    /// Create a new XmlPart.
    pub fn new(
        partname: PackURI,
        content_type: String,
        xml_bytes: Vec<u8>,
        package: Option<PackageId>,
    ) -> Self {
        let rels = RelationshipCollection::new(partname.base_uri());
        Self {
            partname,
            content_type,
            package,
            xml_bytes,
            pending: None,
            rels,
        }
    }

    /// Current XML content as bytes.
    #[inline]
    fn current_xml(&self) -> &[u8] {
        match &self.pending {
            Some(xml) => xml.as_bytes(),
            None => &self.xml_bytes,
        }
    }

    /// Get the XML content as a UTF-8 string.
    pub fn xml_str(&self) -> Result<&str> {
        std::str::from_utf8(self.current_xml()).map_err(Into::into)
    }

    /// Replace the XML content of this part.
    pub fn set_xml<S: Into<String>>(&mut self, xml: S) {
        self.pending = Some(xml.into());
    }

    /// Whether edited markup is waiting to be folded into the blob.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.pending.is_some()
    }

    /// Get a reader for parsing the XML content.
    pub fn reader(&self) -> Reader<&[u8]> {
        let mut reader = Reader::from_reader(self.current_xml());
        reader.config_mut().trim_text(true);
        reader
    }

    /// Find all elements matching a local name and extract their attributes.
    ///
    /// Returns one map of attribute name to unescaped value per matching element.
    pub fn find_elements_with_attrs(
        &self,
        element_name: &str,
    ) -> Result<Vec<HashMap<String, String>>> {
        let mut reader = self.reader();
        let mut buf = Vec::new();
        let mut results = Vec::new();
        let element_name_bytes = element_name.as_bytes();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                    if e.local_name().as_ref() == element_name_bytes {
                        let mut attrs = HashMap::new();
                        for attr in e.attributes() {
                            let attr = attr?;
                            let key = std::str::from_utf8(attr.key.as_ref())?;
                            let value = attr.unescape_value()?;
                            attrs.insert(key.to_string(), value.to_string());
                        }
                        results.push(attrs);
                    }
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(OpcError::XmlError(format!("XML parse error: {}", e))),
                _ => {},
            }
            buf.clear();
        }

        Ok(results)
    }

    /// Count `id` attributes in the office relationships namespace whose value is `r_id`.
    ///
    /// The prefix is resolved, so `r:id` and any other prefix bound to that
    /// namespace both count.
    fn count_r_id_attrs(&self, r_id: &str) -> Result<usize> {
        let mut reader = NsReader::from_reader(self.current_xml());
        let mut buf = Vec::new();
        let mut count = 0;

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    for attr in e.attributes() {
                        let attr = attr?;
                        if attr.value.as_ref() != r_id.as_bytes() {
                            continue;
                        }
                        let (ns, local) = reader.resolve_attribute(attr.key);
                        let in_rels_ns = matches!(
                            ns,
                            ResolveResult::Bound(Namespace(uri))
                                if uri == namespace::OFC_RELATIONSHIPS.as_bytes()
                        );
                        if in_rels_ns && local.as_ref() == b"id" {
                            count += 1;
                        }
                    }
                },
                Event::Eof => break,
                _ => {},
            }
            buf.clear();
        }

        Ok(count)
    }
}

impl LoadPart for XmlPart {
    fn load(
        partname: PackURI,
        content_type: String,
        package: Option<PackageId>,
        xml_bytes: Vec<u8>,
    ) -> Result<Self> {
        std::str::from_utf8(&xml_bytes)
            .map_err(|e| OpcError::XmlError(format!("Invalid UTF-8 in {}: {}", partname, e)))?;

        Ok(Self::new(partname, content_type, xml_bytes, package))
    }
}

impl Part for XmlPart {
    fn partname(&self) -> &PackURI {
        &self.partname
    }

    fn set_partname(&mut self, partname: PackURI) {
        self.rels.rebase(partname.base_uri());
        self.partname = partname;
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn blob(&self) -> Option<&[u8]> {
        Some(self.current_xml())
    }

    fn package(&self) -> Option<PackageId> {
        self.package
    }

    fn set_package(&mut self, package: Option<PackageId>) {
        self.package = package;
    }

    fn rels(&self) -> &RelationshipCollection {
        &self.rels
    }

    fn rels_mut(&mut self) -> &mut RelationshipCollection {
        &mut self.rels
    }

    fn before_marshal(&mut self) {
        if let Some(xml) = self.pending.take() {
            self.xml_bytes = xml.into_bytes();
        }
    }

    fn rel_ref_count(&self, r_id: &str) -> usize {
        match self.count_r_id_attrs(r_id) {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(
                    partname = %self.partname,
                    error = %e,
                    "unparseable XML, counting rId references by bytes"
                );
                let pattern = format!(r#"r:id="{}""#, r_id);
                memmem::find_iter(self.current_xml(), pattern.as_bytes()).count()
            },
        }
    }
}

/// Constructor stored in the [`PartFactory`] registry.
///
/// Arguments are `(partname, content_type, package, blob)`.
pub type PartConstructor =
    fn(PackURI, String, Option<PackageId>, Vec<u8>) -> Result<Box<dyn Part>>;

fn load_boxed<T: LoadPart>(
    partname: PackURI,
    content_type: String,
    package: Option<PackageId>,
    blob: Vec<u8>,
) -> Result<Box<dyn Part>> {
    Ok(Box::new(T::load(partname, content_type, package, blob)?))
}

/// Fallback constructor: XmlPart for XML content types, BlobPart otherwise.
fn load_default_part(
    partname: PackURI,
    content_type: String,
    package: Option<PackageId>,
    blob: Vec<u8>,
) -> Result<Box<dyn Part>> {
    if PartFactory::is_xml_content_type(&content_type) {
        load_boxed::<XmlPart>(partname, content_type, package, blob)
    } else {
        load_boxed::<BlobPart>(partname, content_type, package, blob)
    }
}

/// Registry choosing the Part implementation for a content type.
///
/// Lookups that miss the registry fall back to `default_part_type`. The
/// registry is a plain value: build one at startup, register custom part
/// types on it and pass it to
/// [`OpcPackage::open_with`](crate::opc::OpcPackage::open_with).
#[derive(Debug, Clone)]
pub struct PartFactory {
    part_type_for: BTreeMap<String, PartConstructor>,
    default_part_type: PartConstructor,
}

impl PartFactory {
    /// An empty registry whose fallback loads XmlPart or BlobPart.
    pub fn new() -> Self {
        Self {
            part_type_for: BTreeMap::new(),
            default_part_type: load_default_part,
        }
    }

    /// Register a constructor for a content type, replacing any previous one.
    pub fn register<S: Into<String>>(
        &mut self,
        content_type: S,
        constructor: PartConstructor,
    ) -> &mut Self {
        self.part_type_for.insert(content_type.into(), constructor);
        self
    }

    /// Register `T::load` for a content type.
    pub fn register_part<T: LoadPart>(&mut self, content_type: &str) -> &mut Self {
        self.register(content_type, load_boxed::<T>)
    }

    /// Replace the fallback used for unregistered content types.
    pub fn set_default_part_type(&mut self, constructor: PartConstructor) -> &mut Self {
        self.default_part_type = constructor;
        self
    }

    #[inline]
    pub fn is_registered(&self, content_type: &str) -> bool {
        self.part_type_for.contains_key(content_type)
    }

    /// Registered content types, in sorted order.
    pub fn content_types(&self) -> impl Iterator<Item = &str> {
        self.part_type_for.keys().map(String::as_str)
    }

    /// The constructor that would be used for `content_type`.
    pub fn constructor_for(&self, content_type: &str) -> PartConstructor {
        self.part_type_for
            .get(content_type)
            .copied()
            .unwrap_or(self.default_part_type)
    }

    /// Construct the part for a serialized package member.
    pub fn create(
        &self,
        partname: PackURI,
        content_type: String,
        blob: Vec<u8>,
        package: Option<PackageId>,
    ) -> Result<Box<dyn Part>> {
        let constructor = self.constructor_for(&content_type);
        constructor(partname, content_type, package, blob)
    }

    /// Check if a content type represents XML content.
    #[inline]
    fn is_xml_content_type(content_type: &str) -> bool {
        content_type.ends_with("+xml") || content_type.ends_with("/xml")
    }
}

impl Default for PartFactory {
    /// Registry with the PresentationML and shared Office XML parts mapped to XmlPart.
    fn default() -> Self {
        let mut factory = Self::new();
        for content_type in [
            ct::PML_PRESENTATION_MAIN,
            ct::PML_PRES_PROPS,
            ct::PML_VIEW_PROPS,
            ct::PML_TABLE_STYLES,
            ct::PML_SLIDE,
            ct::PML_SLIDE_LAYOUT,
            ct::PML_SLIDE_MASTER,
            ct::PML_NOTES_SLIDE,
            ct::PML_NOTES_MASTER,
            ct::DML_CHART,
            ct::DML_DIAGRAM_DATA,
            ct::OFC_THEME,
            ct::OFC_EXTENDED_PROPERTIES,
            ct::OPC_CORE_PROPERTIES,
        ] {
            factory.register_part::<XmlPart>(content_type);
        }
        for content_type in [ct::PNG, ct::JPEG, ct::GIF, ct::BMP, ct::TIFF, ct::X_EMF, ct::X_WMF] {
            factory.register_part::<BlobPart>(content_type);
        }
        factory
    }
}
