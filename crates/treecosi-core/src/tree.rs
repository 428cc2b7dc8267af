//! Rosters and the two-level signing trees built over them
//!
//! A tree always has the shape root → subleader → leaves. The builder
//! partitions a global roster into shards that share the roster head as
//! their root, and can rebuild a single shard with a different subleader
//! when the current one stops responding.

use k256::ProjectivePoint;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One roster entry: the signer's network address and public key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Signer {
    pub address: String,
    #[serde(with = "point_hex")]
    pub public: ProjectivePoint,
}

/// Ordered list of signers
///
/// Indices are stable and double as mask bit positions, so a roster is
/// never reordered once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roster {
    list: Vec<Signer>,
}

impl Roster {
    /// Create a roster from an ordered signer list
    pub fn new(list: Vec<Signer>) -> Result<Self> {
        if list.is_empty() {
            return Err(Error::InvalidArgument("empty roster".into()));
        }
        Ok(Self { list })
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Signer> {
        self.list.get(index)
    }

    pub fn list(&self) -> &[Signer] {
        &self.list
    }

    /// Public keys in roster order
    pub fn publics(&self) -> Vec<ProjectivePoint> {
        self.list.iter().map(|signer| signer.public).collect()
    }
}

/// One node of a tree arena: a roster position plus parent/child links
#[derive(Clone, Debug)]
pub struct TreeNode {
    /// Position in the tree's (sub-)roster
    pub roster_index: usize,
    /// Arena id of the parent, `None` for the root
    pub parent: Option<usize>,
    /// Arena ids of the children, in creation order
    pub children: Vec<usize>,
}

/// A two-level tree over a (sub-)roster, stored as an arena with the root
/// at slot 0
#[derive(Clone, Debug)]
pub struct Tree {
    roster: Roster,
    nodes: Vec<TreeNode>,
}

impl Tree {
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn node(&self, id: usize) -> &TreeNode {
        &self.nodes[id]
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    /// Number of nodes in the tree
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// The depth-1 node, if the tree has more than just a root
    pub fn subleader(&self) -> Option<&TreeNode> {
        self.root().children.first().map(|&id| &self.nodes[id])
    }

    /// Roster index of the current subleader
    pub fn subleader_roster_index(&self) -> Option<usize> {
        self.subleader().map(|node| node.roster_index)
    }

    /// The signer record backing an arena node
    pub fn signer(&self, node_id: usize) -> &Signer {
        &self.roster.list[self.nodes[node_id].roster_index]
    }
}

/// Partition a roster of `n_nodes` signers into shards sharing the roster
/// head as root.
///
/// Emits exactly `max(1, min(n_subtrees, n_nodes - 1))` trees. The non-root
/// signers are split as evenly as possible, surplus going to the
/// lowest-indexed shards.
pub fn build_shards(roster: &Roster, n_nodes: usize, n_subtrees: usize) -> Result<Vec<Tree>> {
    if roster.is_empty() {
        return Err(Error::InvalidArgument("empty roster".into()));
    }
    if n_nodes < 1 {
        return Err(Error::InvalidArgument(format!(
            "cannot build trees over {n_nodes} nodes"
        )));
    }
    if n_subtrees < 1 {
        return Err(Error::InvalidArgument(format!(
            "cannot build {n_subtrees} subtrees"
        )));
    }
    if roster.len() < n_nodes {
        return Err(Error::InvalidArgument(format!(
            "trees need {} nodes but the roster holds {}",
            n_nodes,
            roster.len()
        )));
    }

    let mut n_subtrees = n_subtrees;
    if n_nodes <= n_subtrees {
        n_subtrees = n_nodes - 1;
    }

    // single signer: one trivial root-only tree
    if n_subtrees == 0 {
        let local = Roster::new(vec![roster.list[0].clone()])?;
        return Ok(vec![Tree {
            roster: local,
            nodes: vec![TreeNode {
                roster_index: 0,
                parent: None,
                children: Vec::new(),
            }],
        }]);
    }

    let base = (n_nodes - 1) / n_subtrees;
    let surplus = (n_nodes - 1) % n_subtrees;

    let mut trees = Vec::with_capacity(n_subtrees);
    let mut start = 1;
    for shard in 0..n_subtrees {
        let mut end = start + base;
        if shard < surplus {
            end += 1;
        }

        let mut members = vec![roster.list[0].clone()];
        members.extend_from_slice(&roster.list[start..end]);
        trees.push(build_subtree(&Roster::new(members)?, 1)?);

        start = end;
    }

    Ok(trees)
}

/// Build one shard's tree over its sub-roster, with the signer at
/// `subleader` promoted to depth 1 and everyone else a leaf under it.
///
/// The sub-roster itself never changes; rotation is purely topological.
pub fn build_subtree(roster: &Roster, subleader: usize) -> Result<Tree> {
    if roster.len() < 2 {
        return Err(Error::InvalidArgument(format!(
            "a shard needs at least 2 signers, got {}",
            roster.len()
        )));
    }
    if subleader < 1 || subleader >= roster.len() {
        return Err(Error::InvalidArgument(format!(
            "subleader index {} out of range 1..{}",
            subleader,
            roster.len()
        )));
    }

    let mut nodes = vec![
        TreeNode {
            roster_index: 0,
            parent: None,
            children: vec![1],
        },
        TreeNode {
            roster_index: subleader,
            parent: Some(0),
            children: Vec::new(),
        },
    ];

    for index in 1..roster.len() {
        if index == subleader {
            continue;
        }
        let id = nodes.len();
        nodes.push(TreeNode {
            roster_index: index,
            parent: Some(1),
            children: Vec::new(),
        });
        nodes[1].children.push(id);
    }

    Ok(Tree {
        roster: roster.clone(),
        nodes,
    })
}

mod point_hex {
    use k256::ProjectivePoint;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::cosi;

    pub fn serialize<S>(point: &ProjectivePoint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(cosi::point_to_bytes(point)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ProjectivePoint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(serde::de::Error::custom)?;
        cosi::point_from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosi::Keypair;
    use rand::rngs::OsRng;
    use std::collections::HashSet;

    fn roster(n: usize) -> Roster {
        let list = (0..n)
            .map(|i| Signer {
                address: format!("local://signer-{i}"),
                public: Keypair::generate(&mut OsRng).public,
            })
            .collect();
        Roster::new(list).unwrap()
    }

    fn assert_topology(tree: &Tree) {
        assert!(tree.root().parent.is_none());
        assert_eq!(tree.root().roster_index, 0);
        for (id, node) in tree.nodes().iter().enumerate().skip(1) {
            let parent = node.parent.expect("non-root node without parent");
            assert!(tree.node(parent).children.contains(&id));
        }
        if tree.size() > 1 {
            assert_eq!(tree.root().children.len(), 1);
            let subleader = tree.subleader().unwrap();
            assert_ne!(subleader.roster_index, 0);
            for &leaf in &subleader.children {
                let index = tree.node(leaf).roster_index;
                assert_ne!(index, 0);
                assert_ne!(index, subleader.roster_index);
            }
        }
    }

    #[test]
    fn shard_count_is_clamped() {
        for (n_nodes, n_subtrees, expected) in [
            (1, 1, 1),
            (1, 5, 1),
            (2, 1, 1),
            (2, 5, 1),
            (5, 2, 2),
            (5, 4, 4),
            (5, 5, 4),
            (13, 5, 5),
            (24, 5, 5),
        ] {
            let roster = roster(n_nodes);
            let trees = build_shards(&roster, n_nodes, n_subtrees).unwrap();
            assert_eq!(trees.len(), expected, "n={n_nodes} k={n_subtrees}");
            for tree in &trees {
                assert_topology(tree);
            }
        }
    }

    #[test]
    fn shards_partition_the_roster() {
        let n = 24;
        let roster = roster(n);
        let trees = build_shards(&roster, n, 5).unwrap();

        let mut seen = HashSet::new();
        for tree in &trees {
            assert_eq!(tree.roster().get(0).unwrap().address, roster.get(0).unwrap().address);
            for signer in &tree.roster().list()[1..] {
                assert!(seen.insert(signer.address.clone()), "signer in two shards");
            }
        }
        assert_eq!(seen.len(), n - 1);
    }

    #[test]
    fn surplus_goes_to_lowest_shards() {
        // sub-roster sizes are 1 (shared root) + members
        let cases = [
            (10, 3, vec![4, 4, 4]),
            (11, 3, vec![5, 4, 4]),
            (13, 5, vec![4, 4, 3, 3, 3]),
            (24, 5, vec![6, 6, 6, 5, 5]),
        ];
        for (n, k, sizes) in cases {
            let roster = roster(n);
            let trees = build_shards(&roster, n, k).unwrap();
            let got: Vec<usize> = trees.iter().map(|t| t.roster().len()).collect();
            assert_eq!(got, sizes, "n={n} k={k}");
        }
    }

    #[test]
    fn shard_sizes_differ_by_at_most_one() {
        for n in 2..40 {
            for k in 1..8 {
                let roster = roster(n);
                let trees = build_shards(&roster, n, k).unwrap();
                let min = trees.iter().map(|t| t.roster().len()).min().unwrap();
                let max = trees.iter().map(|t| t.roster().len()).max().unwrap();
                assert!(max - min <= 1, "n={n} k={k} min={min} max={max}");
            }
        }
    }

    #[test]
    fn single_signer_tree_is_trivial() {
        let roster = roster(1);
        let trees = build_shards(&roster, 1, 3).unwrap();
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].size(), 1);
        assert!(trees[0].subleader().is_none());
    }

    #[test]
    fn two_signers_make_one_leafless_shard() {
        let roster = roster(2);
        let trees = build_shards(&roster, 2, 1).unwrap();
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].size(), 2);
        let subleader = trees[0].subleader().unwrap();
        assert!(subleader.children.is_empty());
    }

    #[test]
    fn every_shard_gets_one_leaf_when_n_is_k_plus_one() {
        let n = 7;
        let roster = roster(n);
        let trees = build_shards(&roster, n, 3).unwrap();
        assert_eq!(trees.len(), 3);
        for tree in &trees {
            assert_eq!(tree.subleader().unwrap().children.len(), 1);
        }
    }

    #[test]
    fn invalid_arguments_rejected() {
        let roster5 = roster(5);
        assert!(build_shards(&roster5, 0, 2).is_err());
        assert!(build_shards(&roster5, 5, 0).is_err());
        assert!(build_shards(&roster5, 6, 2).is_err());
        assert!(Roster::new(Vec::new()).is_err());
    }

    #[test]
    fn rotation_promotes_and_demotes() {
        let roster = roster(5);
        let trees = build_shards(&roster, 5, 1).unwrap();
        let tree = &trees[0];
        assert_eq!(tree.subleader_roster_index(), Some(1));

        let rotated = build_subtree(tree.roster(), 3).unwrap();
        assert_eq!(rotated.subleader_roster_index(), Some(3));
        assert_topology(&rotated);

        // old subleader is now a leaf, sub-roster unchanged
        let leaf_indices: Vec<usize> = rotated
            .subleader()
            .unwrap()
            .children
            .iter()
            .map(|&id| rotated.node(id).roster_index)
            .collect();
        assert!(leaf_indices.contains(&1));
        assert_eq!(rotated.roster().len(), tree.roster().len());
    }

    #[test]
    fn rotation_index_bounds_checked() {
        let roster = roster(4);
        assert!(build_subtree(&roster, 0).is_err());
        assert!(build_subtree(&roster, 4).is_err());
        assert!(build_subtree(&Roster::new(vec![roster.list()[0].clone()]).unwrap(), 1).is_err());
    }

    #[test]
    fn signer_round_trips_through_json() {
        let roster = roster(2);
        let json = serde_json::to_string(roster.list()).unwrap();
        let back: Vec<Signer> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[1].public, roster.get(1).unwrap().public);
    }
}
