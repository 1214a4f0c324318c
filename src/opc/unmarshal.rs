//! Turns serialized parts and relationships into a wired package graph.
//!
//! The unmarshaller builds every part through a [`PartFactory`], then loads each
//! serialized relationship onto its source (the package or a part), and finally
//! gives parts and package their post-load hook.

use crate::opc::error::{OpcError, Result};
use crate::opc::package::{PackageId, is_package_uri};
use crate::opc::packuri::PackURI;
use crate::opc::part::{Part, PartFactory, PartId};
use crate::opc::pkgreader::{PackageSource, SerializedPart};
use crate::opc::rel::RelTarget;
use std::collections::HashMap;

/// The package side of unmarshalling.
///
/// [`OpcPackage`](crate::opc::OpcPackage) is the implementation used when
/// opening a file.
pub trait PartGraph {
    fn package_id(&self) -> PackageId;

    /// Take ownership of a newly built part.
    fn add_part(&mut self, part: Box<dyn Part>) -> PartId;

    fn part_mut(&mut self, id: PartId) -> Result<&mut dyn Part>;

    /// Record a package-level relationship exactly as persisted.
    fn load_rel(&mut self, reltype: &str, target: RelTarget, r_id: &str);

    /// Called once, after every part's own `after_unmarshal`.
    fn after_unmarshal(&mut self);
}

/// Hosts the static unmarshalling operations.
pub struct Unmarshaller;

impl Unmarshaller {
    /// Construct the parts and relationships of `package` from `pkg_reader`.
    ///
    /// `after_unmarshal` runs on every part, in load order, and then on the package.
    pub fn unmarshal<S, G>(
        pkg_reader: &mut S,
        package: &mut G,
        part_factory: &PartFactory,
    ) -> Result<()>
    where
        S: PackageSource,
        G: PartGraph,
    {
        let parts = Self::unmarshal_parts(pkg_reader, package, part_factory)?;
        let parts_by_name: HashMap<PackURI, PartId> = parts.iter().cloned().collect();
        Self::unmarshal_relationships(pkg_reader, package, &parts_by_name)?;

        for (_, id) in &parts {
            package.part_mut(*id)?.after_unmarshal();
        }
        package.after_unmarshal();
        Ok(())
    }

    /// Build one part per serialized part, in reader order.
    ///
    /// Each part is created by the factory with (partname, content_type, blob,
    /// package) and handed to the package. Returns the partname and id of each.
    pub fn unmarshal_parts<S, G>(
        pkg_reader: &mut S,
        package: &mut G,
        part_factory: &PartFactory,
    ) -> Result<Vec<(PackURI, PartId)>>
    where
        S: PackageSource,
        G: PartGraph,
    {
        let package_id = package.package_id();
        let mut parts = Vec::new();

        for spart in pkg_reader.iter_sparts() {
            let SerializedPart {
                partname,
                content_type,
                reltype,
                blob,
            } = spart;

            tracing::trace!(partname = %partname, reltype = %reltype, "building part");
            let part = part_factory.create(partname.clone(), content_type, blob, Some(package_id))?;
            parts.push((partname, package.add_part(part)));
        }

        tracing::debug!(parts = parts.len(), "unmarshalled parts");
        Ok(parts)
    }

    /// Load every serialized relationship onto its source.
    ///
    /// Source "/" is the package itself; any other source must be one of the
    /// unmarshalled parts, as must every internal target.
    pub fn unmarshal_relationships<S, G>(
        pkg_reader: &S,
        package: &mut G,
        parts_by_name: &HashMap<PackURI, PartId>,
    ) -> Result<()>
    where
        S: PackageSource,
        G: PartGraph,
    {
        let lookup = |partname: &PackURI| {
            parts_by_name
                .get(partname)
                .copied()
                .ok_or_else(|| OpcError::PartNotFound(partname.to_string()))
        };

        for (source, srel) in pkg_reader.iter_srels() {
            let target = if srel.is_external() {
                RelTarget::External(srel.target_ref.clone())
            } else {
                RelTarget::Internal(lookup(&srel.target_partname()?)?)
            };

            if is_package_uri(source) {
                package.load_rel(&srel.reltype, target, &srel.r_id);
            } else {
                package
                    .part_mut(lookup(source)?)?
                    .load_rel(&srel.reltype, target, &srel.r_id);
            }
        }

        Ok(())
    }
}
