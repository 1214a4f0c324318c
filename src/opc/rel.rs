use crate::opc::constants::{namespace, target_mode};
use crate::opc::error::{OpcError, Result};
use crate::opc::packuri::PackURI;
use crate::opc::part::PartId;
use quick_xml::escape::escape;
/// Relationship-related objects for OPC packages.
///
/// This module provides types for managing relationships between parts in an OPC package,
/// including internal and external relationships.
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

/// What a relationship points at.
///
/// Internal targets are parts of the same package, addressed through the
/// package's part arena. External targets are opaque URLs kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelTarget {
    Internal(PartId),
    External(String),
}

impl From<PartId> for RelTarget {
    fn from(id: PartId) -> Self {
        RelTarget::Internal(id)
    }
}

/// Looks up the current partname of a part by its id.
///
/// Internal relationship targets are stored as [`PartId`]s, so turning one
/// into a relative reference needs something that knows the partnames.
pub trait ResolvePart {
    fn partname_of(&self, id: PartId) -> Option<&PackURI>;
}

impl ResolvePart for HashMap<PartId, &PackURI> {
    fn partname_of(&self, id: PartId) -> Option<&PackURI> {
        self.get(&id).copied()
    }
}

/// A single relationship from a source (package or part) to a target.
///
/// Identified within its collection by an rId such as "rId3".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    /// Relationship ID (e.g., "rId1", "rId2")
    r_id: String,

    /// Relationship type URI
    reltype: String,

    target: RelTarget,

    /// Directory of the source, used to make internal targets relative
    base_uri: String,
}

impl Relationship {
    pub fn new(r_id: String, reltype: String, target: RelTarget, base_uri: String) -> Self {
        Self {
            r_id,
            reltype,
            target,
            base_uri,
        }
    }

    /// Get the relationship ID.
    #[inline]
    pub fn r_id(&self) -> &str {
        &self.r_id
    }

    /// Get the relationship type.
    #[inline]
    pub fn reltype(&self) -> &str {
        &self.reltype
    }

    #[inline]
    pub fn target(&self) -> &RelTarget {
        &self.target
    }

    #[inline]
    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// Check if this is an external relationship.
    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self.target, RelTarget::External(_))
    }

    /// Get the target part of an internal relationship.
    ///
    /// Fails with [`OpcError::ExternalTarget`] for an external relationship,
    /// whose target is a URL rather than a part.
    pub fn target_part(&self) -> Result<PartId> {
        match self.target {
            RelTarget::Internal(id) => Ok(id),
            RelTarget::External(_) => Err(OpcError::ExternalTarget(self.r_id.clone())),
        }
    }

    /// Get the target reference as it appears in relationship XML.
    ///
    /// The URL verbatim for an external relationship; for an internal one the
    /// target partname relative to this relationship's base URI,
    /// e.g. "../media/image1.png".
    pub fn target_ref<R: ResolvePart + ?Sized>(&self, parts: &R) -> Result<String> {
        match &self.target {
            RelTarget::External(url) => Ok(url.clone()),
            RelTarget::Internal(id) => {
                let partname = parts.partname_of(*id).ok_or_else(|| {
                    OpcError::PartNotFound(format!("{:?} (target of {})", id, self.r_id))
                })?;
                Ok(partname.relative_ref(&self.base_uri))
            },
        }
    }
}

/// Ordered collection of relationships from a single source.
///
/// Keeps insertion order for serialization and a map from rId to position
/// for O(1) lookup.
#[derive(Debug, Clone, Default)]
pub struct RelationshipCollection {
    /// Base URI for resolving relative references
    base_uri: String,

    rels: Vec<Relationship>,

    /// rId -> position in `rels`
    index: HashMap<String, usize>,
}

impl RelationshipCollection {
    /// Create a new empty relationships collection.
    ///
    /// # Arguments
    /// * `base_uri` - Directory of the source; "/" for the package itself
    pub fn new<S: Into<String>>(base_uri: S) -> Self {
        Self {
            base_uri: base_uri.into(),
            rels: Vec::new(),
            index: HashMap::new(),
        }
    }

    #[inline]
    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// Move the collection (and every relationship in it) to a new base URI,
    /// as when the source part is renamed.
    pub fn rebase<S: Into<String>>(&mut self, base_uri: S) {
        self.base_uri = base_uri.into();
        for rel in &mut self.rels {
            rel.base_uri.clone_from(&self.base_uri);
        }
    }

    /// Append a relationship and return a reference to it.
    ///
    /// The rId is taken as given. Keeping rIds unique is the caller's job;
    /// re-using one points lookups at the newest relationship.
    pub fn add_relationship(
        &mut self,
        reltype: &str,
        target: RelTarget,
        r_id: &str,
    ) -> &Relationship {
        let rel = Relationship::new(
            r_id.to_string(),
            reltype.to_string(),
            target,
            self.base_uri.clone(),
        );
        let pos = self.rels.len();
        self.rels.push(rel);
        self.index.insert(r_id.to_string(), pos);
        &self.rels[pos]
    }

    /// Get a relationship by its ID.
    #[inline]
    pub fn get(&self, r_id: &str) -> Option<&Relationship> {
        self.index.get(r_id).map(|&pos| &self.rels[pos])
    }

    /// Get a relationship by its ID, failing with
    /// [`OpcError::RelationshipNotFound`] for an unknown rId.
    pub fn rel(&self, r_id: &str) -> Result<&Relationship> {
        self.get(r_id)
            .ok_or_else(|| OpcError::RelationshipNotFound(format!("rId: {}", r_id)))
    }

    /// Get the relationship at `index` in insertion order.
    ///
    /// Fails with [`OpcError::IndexOutOfRange`] past the end.
    pub fn get_index(&self, index: usize) -> Result<&Relationship> {
        self.rels.get(index).ok_or(OpcError::IndexOutOfRange {
            index,
            len: self.rels.len(),
        })
    }

    #[inline]
    pub fn contains(&self, r_id: &str) -> bool {
        self.index.contains_key(r_id)
    }

    /// Get or add a relationship of `reltype` to `target_part`.
    ///
    /// An existing internal relationship with the same type and target is
    /// reused; otherwise one is added under the next available rId.
    pub fn get_or_add(&mut self, reltype: &str, target_part: PartId) -> &Relationship {
        let existing = self.rels.iter().position(|rel| {
            rel.reltype() == reltype && rel.target() == &RelTarget::Internal(target_part)
        });

        match existing {
            Some(pos) => &self.rels[pos],
            None => {
                let r_id = self.next_r_id();
                self.add_relationship(reltype, RelTarget::Internal(target_part), &r_id)
            },
        }
    }

    /// Get or add an external relationship of `reltype` to `url`, returning its rId.
    pub fn get_or_add_ext_rel(&mut self, reltype: &str, url: &str) -> String {
        let existing = self.rels.iter().find(|rel| {
            rel.reltype() == reltype
                && matches!(rel.target(), RelTarget::External(target) if target == url)
        });
        if let Some(rel) = existing {
            return rel.r_id().to_string();
        }

        let r_id = self.next_r_id();
        self.add_relationship(reltype, RelTarget::External(url.to_string()), &r_id);
        r_id
    }

    /// Next rId: one past the highest numeric "rIdN" suffix in use.
    ///
    /// rIds not of that form, or with a suffix beyond `u64`, are ignored. When the
    /// highest suffix is `u64::MAX` the lowest unused number is taken instead.
    /// Returns "rId1" for an empty collection.
    fn next_r_id(&self) -> String {
        let used: BTreeSet<u64> = self
            .rels
            .iter()
            .filter_map(|rel| {
                rel.r_id()
                    .strip_prefix("rId")
                    .and_then(|digits| atoi_simd::parse::<u64, false, false>(digits.as_bytes()).ok())
            })
            .filter(|&n| n > 0)
            .collect();

        let next = match used.last() {
            None => 1,
            Some(&highest) => highest.checked_add(1).unwrap_or_else(|| {
                (1u64..)
                    .zip(&used)
                    .find(|&(n, &in_use)| n != in_use)
                    .map_or(used.len() as u64 + 1, |(n, _)| n)
            }),
        };

        format!("rId{}", next)
    }

    /// Target part of the first relationship of type `reltype`.
    ///
    /// Fails with [`OpcError::RelationshipNotFound`] if there is none. When
    /// several relationships share the type, the earliest one wins.
    pub fn part_with_reltype(&self, reltype: &str) -> Result<PartId> {
        self.rels
            .iter()
            .find(|rel| rel.reltype() == reltype)
            .ok_or_else(|| {
                OpcError::RelationshipNotFound(format!("No relationship of type '{}'", reltype))
            })?
            .target_part()
    }

    /// Get an iterator over all relationships in insertion order.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Relationship> {
        self.rels.iter()
    }

    /// Get the number of relationships in the collection.
    #[inline]
    pub fn len(&self) -> usize {
        self.rels.len()
    }

    /// Check if the collection is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rels.is_empty()
    }

    /// Remove a relationship by its ID.
    pub fn remove(&mut self, r_id: &str) -> Option<Relationship> {
        let pos = self.index.remove(r_id)?;
        let removed = self.rels.remove(pos);
        self.reindex();
        Some(removed)
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (pos, rel) in self.rels.iter().enumerate() {
            self.index.insert(rel.r_id().to_string(), pos);
        }
    }

    /// Serialize relationships to the XML of a .rels part.
    ///
    /// One `Relationship` element per entry, in collection order. External
    /// relationships carry `TargetMode="External"`.
    pub fn xml<R: ResolvePart + ?Sized>(&self, parts: &R) -> Result<String> {
        let mut xml = String::with_capacity(256 + self.rels.len() * 160);

        xml.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        xml.push('\n');
        let _ = write!(xml, r#"<Relationships xmlns="{}">"#, namespace::OPC_RELATIONSHIPS);
        xml.push('\n');

        for rel in &self.rels {
            let target_ref = rel.target_ref(parts)?;
            let _ = write!(
                xml,
                r#"  <Relationship Id="{}" Type="{}" Target="{}""#,
                escape(rel.r_id()),
                escape(rel.reltype()),
                escape(target_ref.as_str()),
            );
            if rel.is_external() {
                let _ = write!(xml, r#" TargetMode="{}""#, target_mode::EXTERNAL);
            }
            xml.push_str("/>\n");
        }

        xml.push_str("</Relationships>");

        Ok(xml)
    }
}

impl<'a> IntoIterator for &'a RelationshipCollection {
    type Item = &'a Relationship;
    type IntoIter = std::slice::Iter<'a, Relationship>;

    fn into_iter(self) -> Self::IntoIter {
        self.rels.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://github.com/scanny/python-pptx";
    const RELTYPE: &str = "http://rel/type";

    fn external(url: &str) -> RelTarget {
        RelTarget::External(url.to_string())
    }

    #[test]
    fn test_relationship_creation() {
        let target = PartId::new(4);
        let rel = Relationship::new(
            "rId9".to_string(),
            "reltype".to_string(),
            RelTarget::Internal(target),
            "/ppt".to_string(),
        );

        assert_eq!(rel.r_id(), "rId9");
        assert_eq!(rel.reltype(), "reltype");
        assert_eq!(rel.target_part().unwrap(), target);
        assert!(!rel.is_external());
    }

    #[test]
    fn test_target_part_fails_on_external_rel() {
        let rel = Relationship::new(String::new(), String::new(), external(""), String::new());
        assert!(matches!(rel.target_part(), Err(OpcError::ExternalTarget(_))));
    }

    #[test]
    fn test_target_ref_for_external_rel() {
        let rel = Relationship::new(
            String::new(),
            String::new(),
            external("target"),
            String::new(),
        );
        let parts: HashMap<PartId, &PackURI> = HashMap::new();
        assert_eq!(rel.target_ref(&parts).unwrap(), "target");
    }

    #[test]
    fn test_relative_ref_for_internal_rel() {
        let image = PackURI::new("/ppt/media/image1.png").unwrap();
        let id = PartId::new(0);
        let parts = HashMap::from([(id, &image)]);

        let rel = Relationship::new(
            "rId1".to_string(),
            RELTYPE.to_string(),
            RelTarget::Internal(id),
            "/ppt/slides".to_string(),
        );
        assert_eq!(rel.target_ref(&parts).unwrap(), "../media/image1.png");
    }

    #[test]
    fn test_target_ref_for_dangling_internal_rel() {
        let rel = Relationship::new(
            "rId1".to_string(),
            RELTYPE.to_string(),
            RelTarget::Internal(PartId::new(7)),
            "/ppt".to_string(),
        );
        let parts: HashMap<PartId, &PackURI> = HashMap::new();
        assert!(matches!(rel.target_ref(&parts), Err(OpcError::PartNotFound(_))));
    }

    #[test]
    fn test_empty_collection() {
        let rels = RelationshipCollection::new("/");
        assert_eq!(rels.len(), 0);
        assert!(rels.is_empty());
        assert!(matches!(
            rels.get_index(0),
            Err(OpcError::IndexOutOfRange { index: 0, len: 0 })
        ));
    }

    #[test]
    fn test_lookup_by_r_id() {
        let mut rels = RelationshipCollection::new("/");
        rels.add_relationship(RELTYPE, external(URL), "foobar");

        assert_eq!(rels.rel("foobar").unwrap().r_id(), "foobar");
        assert!(rels.contains("foobar"));
        assert!(matches!(
            rels.rel("barfoo"),
            Err(OpcError::RelationshipNotFound(_))
        ));
    }

    #[test]
    fn test_add_relationship() {
        let mut rels = RelationshipCollection::new("baseURI");
        let target = PartId::new(1);
        let rel = rels
            .add_relationship("reltype", RelTarget::Internal(target), "rId9")
            .clone();

        assert_eq!(rels.get_index(0).unwrap(), &rel);
        assert_eq!(rel.r_id(), "rId9");
        assert_eq!(rel.reltype(), "reltype");
        assert_eq!(rel.base_uri(), "baseURI");
        assert_eq!(rel.target(), &RelTarget::Internal(target));
    }

    #[test]
    fn test_add_external_relationship() {
        let mut rels = RelationshipCollection::new("/ppt/slides");
        let r_id = rels.get_or_add_ext_rel(RELTYPE, URL);

        let rel = rels.rel(&r_id).unwrap();
        assert!(rel.is_external());
        assert_eq!(rel.target(), &external(URL));
        assert_eq!(rel.reltype(), RELTYPE);
    }

    #[test]
    fn test_get_or_add_ext_rel_reuses_match() {
        let mut rels = RelationshipCollection::new("/ppt/slides");
        rels.add_relationship(RELTYPE, external(URL), "rId369");

        assert_eq!(rels.get_or_add_ext_rel(RELTYPE, URL), "rId369");
        assert_eq!(rels.get_or_add_ext_rel(RELTYPE, URL), "rId369");
        assert_eq!(rels.len(), 1);

        // Same URL under another reltype is a different relationship
        assert_eq!(rels.get_or_add_ext_rel("http://other/type", URL), "rId370");
        assert_eq!(rels.len(), 2);
    }

    #[test]
    fn test_get_or_add() {
        let mut rels = RelationshipCollection::new("/ppt");
        let slide = PartId::new(0);
        let master = PartId::new(1);

        assert_eq!(rels.get_or_add("type1", slide).r_id(), "rId1");
        assert_eq!(rels.get_or_add("type1", slide).r_id(), "rId1");
        assert_eq!(rels.get_or_add("type1", master).r_id(), "rId2");
        assert_eq!(rels.get_or_add("type2", slide).r_id(), "rId3");
        assert_eq!(rels.len(), 3);
    }

    #[test]
    fn test_get_or_add_ignores_external_with_same_reltype() {
        let mut rels = RelationshipCollection::new("/ppt");
        rels.add_relationship("type1", external(URL), "rId1");

        let rel = rels.get_or_add("type1", PartId::new(0));
        assert_eq!(rel.r_id(), "rId2");
        assert!(!rel.is_external());
    }

    #[test]
    fn test_next_r_id_uses_highest_suffix() {
        let mut rels = RelationshipCollection::new("/ppt");
        assert_eq!(rels.next_r_id(), "rId1");

        rels.add_relationship("t", external("a"), "rId1");
        rels.add_relationship("t", external("b"), "rId5");
        rels.add_relationship("t", external("c"), "custom");
        assert_eq!(rels.next_r_id(), "rId6");
    }

    #[test]
    fn test_next_r_id_past_u32_suffix() {
        let mut rels = RelationshipCollection::new("/ppt/slides");
        rels.add_relationship("t", external("a"), "rId4294967295");

        assert_eq!(rels.get_or_add_ext_rel("t2", "b"), "rId4294967296");
    }

    #[test]
    fn test_next_r_id_fills_gap_at_u64_max() {
        let mut rels = RelationshipCollection::new("/ppt/slides");
        rels.add_relationship("t", external("a"), "rId1");
        rels.add_relationship("t", external("b"), "rId2");
        rels.add_relationship("t", external("c"), "rId18446744073709551615");
        rels.add_relationship("t", external("d"), "rId99999999999999999999");

        assert_eq!(rels.get_or_add_ext_rel("t2", "e"), "rId3");
    }

    #[test]
    fn test_part_with_reltype() {
        let mut rels = RelationshipCollection::new("/ppt");
        let first = PartId::new(0);
        let second = PartId::new(1);
        rels.add_relationship("other", external(URL), "rId1");
        rels.add_relationship(RELTYPE, RelTarget::Internal(first), "rId2");
        rels.add_relationship(RELTYPE, RelTarget::Internal(second), "rId3");

        assert_eq!(rels.part_with_reltype(RELTYPE).unwrap(), first);
        assert!(matches!(
            rels.part_with_reltype("missing"),
            Err(OpcError::RelationshipNotFound(_))
        ));
        assert!(matches!(
            rels.part_with_reltype("other"),
            Err(OpcError::ExternalTarget(_))
        ));
    }

    #[test]
    fn test_remove() {
        let mut rels = RelationshipCollection::new("/ppt");
        rels.add_relationship("t", external("a"), "rId1");
        rels.add_relationship("t", external("b"), "rId2");
        rels.add_relationship("t", external("c"), "rId3");

        let removed = rels.remove("rId2").unwrap();
        assert_eq!(removed.r_id(), "rId2");
        assert!(rels.remove("rId2").is_none());
        assert_eq!(rels.len(), 2);
        assert_eq!(rels.rel("rId3").unwrap().target(), &external("c"));
        assert_eq!(rels.get_index(1).unwrap().r_id(), "rId3");
    }

    #[test]
    fn test_compose_rels_xml() {
        let image = PackURI::new("/ppt/media/image1.png").unwrap();
        let image_id = PartId::new(0);
        let parts = HashMap::from([(image_id, &image)]);

        let mut rels = RelationshipCollection::new("/ppt/slides");
        rels.add_relationship("http://rt-hyperlink", external("http://some/link"), "rId1");
        rels.add_relationship("http://rt-image", RelTarget::Internal(image_id), "rId2");

        let xml = rels.xml(&parts).unwrap();
        let expected = concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            "\n",
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
            "\n",
            r#"  <Relationship Id="rId1" Type="http://rt-hyperlink" Target="http://some/link" TargetMode="External"/>"#,
            "\n",
            r#"  <Relationship Id="rId2" Type="http://rt-image" Target="../media/image1.png"/>"#,
            "\n",
            "</Relationships>",
        );
        assert_eq!(xml, expected);
    }

    #[test]
    fn test_rels_xml_escapes_targets() {
        let mut rels = RelationshipCollection::new("/ppt/slides");
        rels.add_relationship(
            "http://rt-hyperlink",
            external("http://example.com/?a=1&b=\"2\""),
            "rId1",
        );

        let parts: HashMap<PartId, &PackURI> = HashMap::new();
        let xml = rels.xml(&parts).unwrap();
        assert!(xml.contains(r#"Target="http://example.com/?a=1&amp;b=&quot;2&quot;""#));
    }
}
