//! Loading low-fidelity mesh vertices from [`gmsh`](https://www.gmsh.info/) files.
//!
//! Only version 4.1 of the MSH format is supported,
//! as per the [`mshio`] library.

use std::collections::{HashMap, HashSet};

use fixedbitset as fb;
use nalgebra as na;

use crate::PointCloud;

/// Error in loading a mesh from a Gmsh .msh file.
#[derive(thiserror::Error, Debug)]
pub enum GmshError {
    /// Error parsing the .msh file.
    ///
    /// (Implementation note: parser error converted to string
    /// to avoid lifetime issues with the byte slices it contains)
    #[error("Parsing the .msh data failed: {0}")]
    ParseError(String),
    /// The given .msh file contains no nodes.
    #[error("Invalid .msh data: no nodes")]
    MissingNodes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct EntityId {
    dim: i32,
    tag: i32,
}

#[derive(Clone, Debug, Default)]
struct PhysicalGroup {
    entities: HashSet<EntityId>,
    nodes: Vec<usize>,
}

/// Named subsets of mesh vertices, keyed by physical group tag.
pub type VertexGroups = HashMap<String, fb::FixedBitSet>;

/// Load the nodes of a `.msh` file as a 3D point cloud.
///
/// Elements are ignored; the coupling only needs vertex positions.
/// Node order follows the node blocks of the file,
/// which matches the order in which the low-fidelity solver
/// and the modal basis enumerate mesh points.
///
/// # Physical groups
///
/// If the .msh file contains physical groups,
/// a vertex subset is generated for each of them,
/// keyed by the group's integer tag formatted as a string
/// (named groups are currently not supported due to limitations of [`mshio`]).
/// A vertex belongs to a group if the entity its node block is attached to
/// belongs to the group.
/// These are handy for picking out e.g. the coupling interface patch of a mesh.
pub fn load_point_cloud(bytes: &[u8]) -> Result<(PointCloud, VertexGroups), GmshError> {
    let msh = mshio::parse_msh_bytes(bytes).map_err(|e| GmshError::ParseError(format!("{}", e)))?;
    let nodes = msh.data.nodes.ok_or(GmshError::MissingNodes)?;

    let mut physical_groups = gather_physical_groups(msh.data.entities.as_ref());

    let mut vertices: Vec<na::Vector3<f64>> = Vec::new();
    for block in &nodes.node_blocks {
        let ent_id = EntityId {
            dim: block.entity_dim,
            tag: block.entity_tag,
        };
        let mut phys_groups: Vec<&mut PhysicalGroup> = physical_groups
            .values_mut()
            .filter(|pg| pg.entities.contains(&ent_id))
            .collect();

        for node in &block.nodes {
            let vert_idx = vertices.len();
            vertices.push(na::Vector3::new(node.x, node.y, node.z));
            for g in &mut phys_groups {
                g.nodes.push(vert_idx);
            }
        }
    }

    if vertices.is_empty() {
        return Err(GmshError::MissingNodes);
    }

    let vertex_count = vertices.len();
    let groups = physical_groups
        .into_iter()
        .map(|(group_id, group)| {
            let mut bits = fb::FixedBitSet::with_capacity(vertex_count);
            for idx in group.nodes {
                bits.insert(idx);
            }
            (format!("{}", group_id), bits)
        })
        .collect();

    Ok((PointCloud::new(vertices), groups))
}

/// Collect the physical groups defined in a .msh file
/// into a structure we can easily look them up from.
///
/// This only populates the `entities` field of each group;
/// nodes are filled in while reading the node blocks.
fn gather_physical_groups(
    entities: Option<&mshio::Entities<i32, f64>>,
) -> HashMap<i32, PhysicalGroup> {
    let Some(entities) = entities else {
        return HashMap::new();
    };

    let mut groups: HashMap<i32, PhysicalGroup> = HashMap::new();
    let mut add = |dim: i32, tag: i32, physical_tags: &[i32]| {
        for ptag in physical_tags {
            groups
                .entry(*ptag)
                .or_default()
                .entities
                .insert(EntityId { dim, tag });
        }
    };

    for point in &entities.points {
        add(0, point.tag, &point.physical_tags);
    }
    for curve in &entities.curves {
        add(1, curve.tag, &curve.physical_tags);
    }
    for surface in &entities.surfaces {
        add(2, surface.tag, &surface.physical_tags);
    }
    for volume in &entities.volumes {
        add(3, volume.tag, &volume.physical_tags);
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two point entities with one node each,
    /// the first of which belongs to physical group 100.
    const TWO_POINTS: &str = "$MeshFormat
4.1 0 8
$EndMeshFormat
$Entities
2 0 0 0
1 0 0 0 1 100
2 1 0 0 0
$EndEntities
$Nodes
2 2 1 2
0 1 0 1
1
0 0 0
0 2 0 1
2
1 0 0
$EndNodes
$Elements
2 2 1 2
0 1 15 1
1 1
0 2 15 1
2 2
$EndElements
";

    #[test]
    fn nodes_and_groups() {
        let (cloud, groups) =
            load_point_cloud(TWO_POINTS.as_bytes()).expect("Failed to load mesh");

        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud[1], na::Vector3::new(1., 0., 0.));

        let group = groups.get("100").expect("group didn't exist");
        itertools::assert_equal(group.ones(), [0]);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            load_point_cloud(b"not a mesh"),
            Err(GmshError::ParseError(_))
        ));
    }
}
