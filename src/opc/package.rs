/// Objects that implement reading and writing OPC packages.
///
/// This module provides the main OpcPackage type, which represents an Open Packaging
/// Convention package in memory: the package-level relationships, storage for its
/// parts, and the open/save orchestration.
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::opc::error::{OpcError, Result};
use crate::opc::packuri::{PACKAGE_URI, PackURI};
use crate::opc::part::{Part, PartFactory, PartId};
use crate::opc::phys_pkg::{PhysPkgReader, WriteOptions};
use crate::opc::pkgreader::PackageReader;
use crate::opc::pkgwriter::PackageWriter;
use crate::opc::rel::{RelTarget, Relationship, RelationshipCollection, ResolvePart};
use crate::opc::unmarshal::{PartGraph, Unmarshaller};

static NEXT_PACKAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an [`OpcPackage`] instance.
///
/// Parts carry it as a non-owning back-reference to the package they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageId(u64);

impl PackageId {
    #[inline]
    pub(crate) fn new(raw: u64) -> Self {
        PackageId(raw)
    }

    fn next() -> Self {
        PackageId::new(NEXT_PACKAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Main API class for working with OPC packages.
///
/// Parts are stored by the package and addressed by [`PartId`], but a part only
/// counts as a member of the package while it is reachable from the
/// package-level relationships. [`OpcPackage::iter_parts`] and
/// [`OpcPackage::save`] see exactly the reachable parts.
#[derive(Debug)]
pub struct OpcPackage {
    id: PackageId,

    /// Package-level relationships
    rels: RelationshipCollection,

    /// Part storage, indexed by `PartId`
    parts: Vec<Box<dyn Part>>,
}

impl OpcPackage {
    /// Create a new empty OPC package.
    pub fn new() -> Self {
        Self {
            id: PackageId::next(),
            rels: RelationshipCollection::new(PackURI::package().base_uri()),
            parts: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> PackageId {
        self.id
    }

    /// Open an OPC package from a file, using the default [`PartFactory`].
    ///
    /// # Example
    /// ```no_run
    /// use ooxml_opc::opc::OpcPackage;
    ///
    /// let pkg = OpcPackage::open("deck.pptx").unwrap();
    /// println!("{} parts", pkg.parts().len());
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &PartFactory::default())
    }

    /// Open an OPC package from a file, building parts with `part_factory`.
    pub fn open_with<P: AsRef<Path>>(path: P, part_factory: &PartFactory) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "opening package");
        Self::from_phys_reader(PhysPkgReader::open(path)?, part_factory)
    }

    /// Load an OPC package from a reader.
    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self> {
        Self::from_reader_with(reader, &PartFactory::default())
    }

    /// Load an OPC package from a reader, building parts with `part_factory`.
    pub fn from_reader_with<R: Read + Seek>(reader: R, part_factory: &PartFactory) -> Result<Self> {
        Self::from_phys_reader(PhysPkgReader::new(reader)?, part_factory)
    }

    fn from_phys_reader<R: Read + Seek>(
        mut phys_reader: PhysPkgReader<R>,
        part_factory: &PartFactory,
    ) -> Result<Self> {
        let mut pkg_reader = PackageReader::from_phys_reader(&mut phys_reader)?;

        let mut package = Self::new();
        Unmarshaller::unmarshal(&mut pkg_reader, &mut package, part_factory)?;
        Ok(package)
    }

    /// Get a reference to the package-level relationships.
    #[inline]
    pub fn rels(&self) -> &RelationshipCollection {
        &self.rels
    }

    /// Get a mutable reference to the package-level relationships.
    #[inline]
    pub fn rels_mut(&mut self) -> &mut RelationshipCollection {
        &mut self.rels
    }

    /// Record a package-level relationship read back from a serialized package.
    pub fn load_rel(&mut self, reltype: &str, target: RelTarget, r_id: &str) -> &Relationship {
        self.rels.add_relationship(reltype, target, r_id)
    }

    /// Relate the package to a part and return the rId.
    ///
    /// Reuses an existing relationship of the same type to the same part.
    pub fn relate_to(&mut self, part: PartId, reltype: &str) -> String {
        self.rels.get_or_add(reltype, part).r_id().to_string()
    }

    /// Get the part the package is related to by `reltype`.
    pub fn part_related_by(&self, reltype: &str) -> Result<PartId> {
        self.rels.part_with_reltype(reltype)
    }

    /// Like [`OpcPackage::part_related_by`], returning the part itself.
    pub fn related_part(&self, reltype: &str) -> Result<&dyn Part> {
        self.part(self.part_related_by(reltype)?)
    }

    /// Store a part in the package and return its id.
    ///
    /// The part becomes a member of the package once something relates to it.
    pub fn add_part(&mut self, mut part: Box<dyn Part>) -> PartId {
        part.set_package(Some(self.id));
        let id = PartId::new(self.parts.len());
        self.parts.push(part);
        id
    }

    /// Get a part by id.
    pub fn part(&self, id: PartId) -> Result<&dyn Part> {
        self.parts
            .get(id.index())
            .map(|b| &**b as &dyn Part)
            .ok_or_else(|| OpcError::PartNotFound(format!("{:?}", id)))
    }

    /// Get a mutable reference to a part by id.
    pub fn part_mut(&mut self, id: PartId) -> Result<&mut dyn Part> {
        self.parts
            .get_mut(id.index())
            .map(|b| &mut **b as &mut dyn Part)
            .ok_or_else(|| OpcError::PartNotFound(format!("{:?}", id)))
    }

    /// Find a reachable part by partname.
    pub fn find_part(&self, partname: &PackURI) -> Option<PartId> {
        self.walk_parts()
            .find(|(_, part)| part.partname() == partname)
            .map(|(id, _)| id)
    }

    /// Walk the relationship graph from the package, yielding each reachable part once.
    ///
    /// Depth-first in relationship order; external relationships are not followed.
    pub fn walk_parts(&self) -> PartsWalk<'_> {
        PartsWalk {
            package: self,
            stack: vec![self.rels.iter()],
            visited: HashSet::new(),
        }
    }

    /// Iterate over every part reachable from the package relationships.
    pub fn iter_parts(&self) -> impl Iterator<Item = &dyn Part> {
        self.walk_parts().map(|(_, part)| part)
    }

    /// Every reachable part, in [`OpcPackage::iter_parts`] order.
    pub fn parts(&self) -> Vec<&dyn Part> {
        self.iter_parts().collect()
    }

    /// Ids of every reachable part, in [`OpcPackage::iter_parts`] order.
    pub fn part_ids(&self) -> Vec<PartId> {
        self.walk_parts().map(|(id, _)| id).collect()
    }

    /// Find the next available partname for a part template.
    ///
    /// The template holds a `%d` placeholder, e.g. "/ppt/slides/slide%d.xml";
    /// the lowest number not used by a reachable part is substituted.
    pub fn next_partname(&self, template: &str) -> Result<PackURI> {
        let used: HashSet<&str> = self.iter_parts().map(|part| part.partname().as_str()).collect();

        (1..=used.len() + 1)
            .map(|n| template.replace("%d", &n.to_string()))
            .find(|candidate| !used.contains(candidate.as_str()))
            .ok_or_else(|| OpcError::InvalidPackUri(format!("no free partname for '{}'", template)))
            .and_then(PackURI::new)
    }

    /// Post-load hook, run after every part's own `after_unmarshal`.
    pub fn after_unmarshal(&mut self) {
        tracing::debug!(
            package = ?self.id,
            stored = self.parts.len(),
            reachable = self.walk_parts().count(),
            rels = self.rels.len(),
            "package unmarshalled"
        );
    }

    /// Save the package to a file.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "saving package");
        let file = File::create(path)?;
        let mut writer = self.save_to(BufWriter::new(file))?;
        writer.flush()?;
        Ok(())
    }

    /// Save the package to a writer, returning the writer once the archive is finished.
    pub fn save_to<W: Write + Seek>(&mut self, writer: W) -> Result<W> {
        self.save_with(writer, WriteOptions::default())
    }

    /// Save the package with explicit archive options.
    ///
    /// Every reachable part gets `before_marshal` first; then the package
    /// relationships and the parts are handed to the [`PackageWriter`].
    pub fn save_with<W: Write + Seek>(&mut self, writer: W, options: WriteOptions) -> Result<W> {
        let ids = self.part_ids();
        for &id in &ids {
            self.part_mut(id)?.before_marshal();
        }

        let parts = ids
            .iter()
            .map(|&id| Ok((id, self.part(id)?)))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(parts = parts.len(), rels = self.rels.len(), "marshalling package");

        PackageWriter::write_with(writer, &self.rels, &parts, options)
    }

    /// Serialize the package to bytes.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        Ok(self.save_to(Cursor::new(Vec::new()))?.into_inner())
    }
}

impl Default for OpcPackage {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolvePart for OpcPackage {
    fn partname_of(&self, id: PartId) -> Option<&PackURI> {
        self.parts.get(id.index()).map(|part| part.partname())
    }
}

impl PartGraph for OpcPackage {
    fn package_id(&self) -> PackageId {
        self.id
    }

    fn add_part(&mut self, part: Box<dyn Part>) -> PartId {
        OpcPackage::add_part(self, part)
    }

    fn part_mut(&mut self, id: PartId) -> Result<&mut dyn Part> {
        OpcPackage::part_mut(self, id)
    }

    fn load_rel(&mut self, reltype: &str, target: RelTarget, r_id: &str) {
        OpcPackage::load_rel(self, reltype, target, r_id);
    }

    fn after_unmarshal(&mut self) {
        OpcPackage::after_unmarshal(self)
    }
}

/// Iterator returned by [`OpcPackage::walk_parts`].
///
/// Finite even on cyclic graphs: a part is yielded the first time it is
/// reached and skipped afterwards.
pub struct PartsWalk<'a> {
    package: &'a OpcPackage,
    stack: Vec<std::slice::Iter<'a, Relationship>>,
    visited: HashSet<PartId>,
}

impl<'a> Iterator for PartsWalk<'a> {
    type Item = (PartId, &'a dyn Part);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(rels) = self.stack.last_mut() {
            let Some(rel) = rels.next() else {
                self.stack.pop();
                continue;
            };
            let &RelTarget::Internal(id) = rel.target() else {
                continue;
            };
            if !self.visited.insert(id) {
                continue;
            }

            match self.package.parts.get(id.index()) {
                Some(part) => {
                    self.stack.push(part.rels().iter());
                    return Some((id, part.as_ref()));
                },
                None => {
                    tracing::warn!(?id, r_id = rel.r_id(), "relationship targets a missing part");
                },
            }
        }
        None
    }
}

impl std::fmt::Debug for PartsWalk<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartsWalk")
            .field("package", &self.package.id)
            .field("depth", &self.stack.len())
            .field("visited", &self.visited.len())
            .finish()
    }
}

/// Whether `source` names the package itself rather than a part.
#[inline]
pub(crate) fn is_package_uri(source: &PackURI) -> bool {
    source.as_str() == PACKAGE_URI
}
