//! Static cluster membership.
//!
//! The table is loaded once at startup from a text file with one member per
//! line, `nodeID,ip,controlPort,dataPort`. Blank lines and lines starting with
//! `#` are ignored.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use error_stack::{Report, ResultExt};

use crate::NodeId;
use crate::error::ClusterError;

/// Addresses of a single cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub ip: IpAddr,
    pub control_port: u16,
    pub data_port: u16,
}

impl Member {
    #[must_use]
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.control_port)
    }

    #[must_use]
    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.data_port)
    }
}

/// Immutable map from node id to member addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTable {
    members: BTreeMap<NodeId, Member>,
}

impl ClusterTable {
    /// Build a table from already-validated members.
    pub fn new(
        members: impl IntoIterator<Item = (NodeId, Member)>,
    ) -> Result<Self, Report<ClusterError>> {
        let mut table = BTreeMap::new();
        for (id, member) in members {
            if table.insert(id, member).is_some() {
                return Err(Report::new(ClusterError).attach(format!("duplicate node id {}", id.0)));
            }
        }
        if table.is_empty() {
            return Err(Report::new(ClusterError).attach("cluster table is empty"));
        }
        Ok(Self { members: table })
    }

    /// Read and parse a membership file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Report<ClusterError>> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .change_context(ClusterError)
            .attach(format!("failed to read {}", path.display()))?;
        Self::parse(&text).attach(format!("in {}", path.display()))
    }

    /// Parse membership text.
    pub fn parse(text: &str) -> Result<Self, Report<ClusterError>> {
        let mut members = BTreeMap::new();
        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (id, member) = parse_line(line).attach(format!("line {line_no}: {line:?}"))?;
            if members.insert(id, member).is_some() {
                return Err(Report::new(ClusterError)
                    .attach(format!("line {line_no}: duplicate node id {}", id.0)));
            }
        }
        if members.is_empty() {
            return Err(Report::new(ClusterError).attach("cluster table is empty"));
        }
        Ok(Self { members })
    }

    /// Number of members, `N`.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn len(&self) -> u32 {
        self.members.len() as u32
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Member> {
        self.members.get(&id)
    }

    /// Position of `id` in ascending id order.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn rank(&self, id: NodeId) -> Option<u32> {
        self.members.keys().position(|k| *k == id).map(|r| r as u32)
    }

    /// Smallest number of replies that forms a majority of the cluster.
    #[must_use]
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Member ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    /// Members with an id strictly greater than `id`.
    pub fn higher_than(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.members
            .range((std::ops::Bound::Excluded(id), std::ops::Bound::Unbounded))
            .map(|(k, _)| *k)
    }

    /// Every member except `id`.
    pub fn others(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.ids().filter(move |k| *k != id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Member)> {
        self.members.iter().map(|(k, v)| (*k, v))
    }

    #[must_use]
    pub fn data_addr(&self, id: NodeId) -> Option<SocketAddr> {
        self.members.get(&id).map(Member::data_addr)
    }

    #[must_use]
    pub fn control_addr(&self, id: NodeId) -> Option<SocketAddr> {
        self.members.get(&id).map(Member::control_addr)
    }
}

fn parse_line(line: &str) -> Result<(NodeId, Member), Report<ClusterError>> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [id, ip, control, data] = fields[..] else {
        return Err(Report::new(ClusterError).attach(format!(
            "expected 4 comma-separated fields, found {}",
            fields.len()
        )));
    };
    let id = id
        .parse::<u32>()
        .change_context(ClusterError)
        .attach(format!("bad node id {id:?}"))?;
    let ip = ip
        .parse::<IpAddr>()
        .change_context(ClusterError)
        .attach(format!("bad ip address {ip:?}"))?;
    let control_port = control
        .parse::<u16>()
        .change_context(ClusterError)
        .attach(format!("bad control port {control:?}"))?;
    let data_port = data
        .parse::<u16>()
        .change_context(ClusterError)
        .attach(format!("bad data port {data:?}"))?;
    Ok((
        NodeId(id),
        Member {
            ip,
            control_port,
            data_port,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE: &str = "\
# id,ip,control,data
30,10.0.0.3,7003,8003

10,10.0.0.1,7001,8001
20,10.0.0.2,7002,8002
";

    #[test]
    fn parse_ignores_comments_and_blanks() {
        let table = ClusterTable::parse(THREE).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.ids().collect::<Vec<_>>(),
            vec![NodeId(10), NodeId(20), NodeId(30)]
        );
        assert_eq!(
            table.data_addr(NodeId(20)),
            Some("10.0.0.2:8002".parse().unwrap())
        );
        assert_eq!(
            table.control_addr(NodeId(30)),
            Some("10.0.0.3:7003".parse().unwrap())
        );
    }

    #[test]
    fn rank_follows_sorted_ids() {
        let table = ClusterTable::parse(THREE).unwrap();
        assert_eq!(table.rank(NodeId(10)), Some(0));
        assert_eq!(table.rank(NodeId(20)), Some(1));
        assert_eq!(table.rank(NodeId(30)), Some(2));
        assert_eq!(table.rank(NodeId(99)), None);
    }

    #[test]
    fn higher_than_excludes_self() {
        let table = ClusterTable::parse(THREE).unwrap();
        assert_eq!(
            table.higher_than(NodeId(10)).collect::<Vec<_>>(),
            vec![NodeId(20), NodeId(30)]
        );
        assert_eq!(table.higher_than(NodeId(30)).count(), 0);
        assert_eq!(
            table.others(NodeId(20)).collect::<Vec<_>>(),
            vec![NodeId(10), NodeId(30)]
        );
    }

    #[test]
    fn majority_for_small_clusters() {
        for (n, expected) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4)] {
            let text: String = (0..n)
                .map(|i| format!("{i},127.0.0.1,{},{}\n", 7000 + i, 8000 + i))
                .collect();
            let table = ClusterTable::parse(&text).unwrap();
            assert_eq!(table.majority(), expected, "N = {n}");
        }
    }

    #[test]
    fn duplicate_id_names_the_line() {
        let err = ClusterTable::parse("1,127.0.0.1,1,2\n1,127.0.0.1,3,4\n").unwrap_err();
        assert!(format!("{err:?}").contains("line 2"));
    }

    #[test]
    fn malformed_line_names_the_line() {
        let err = ClusterTable::parse("1,127.0.0.1,1,2\n\n2,not-an-ip,3,4\n").unwrap_err();
        let rendered = format!("{err:?}");
        assert!(rendered.contains("line 3"), "{rendered}");

        assert!(ClusterTable::parse("1,127.0.0.1,1\n").is_err());
        assert!(ClusterTable::parse("x,127.0.0.1,1,2\n").is_err());
        assert!(ClusterTable::parse("1,127.0.0.1,70000,2\n").is_err());
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(ClusterTable::parse("# nothing\n\n").is_err());
        assert!(ClusterTable::new([]).is_err());
    }
}
