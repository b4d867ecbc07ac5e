//! Endpoint classification.
//!
//! The Executor declares which of its endpoints mutate state. The sets are
//! discovered once at startup and cached; request routing is a membership
//! test against them.

use std::collections::HashSet;

use super::pb::EndpointsProto;

/// Routing class of an endpoint name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Mutating endpoint; must traverse the log.
    Write,
    /// Read endpoint; served per the configured consistency mode.
    Read,
    /// Not served by the Executor; the request is rejected.
    Unknown,
}

/// Cached write/read endpoint sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSet {
    write: HashSet<String>,
    read: HashSet<String>,
}

impl EndpointSet {
    pub fn new(
        write: impl IntoIterator<Item = String>,
        read: impl IntoIterator<Item = String>,
    ) -> Self {
        let write: HashSet<String> = write.into_iter().collect();
        // The Executor guarantees disjoint sets; drop any overlap on the read
        // side so a conflicting endpoint stays on the replicated path.
        let read = read.into_iter().filter(|e| !write.contains(e)).collect();
        EndpointSet { write, read }
    }

    pub fn from_proto(proto: &EndpointsProto) -> Self {
        EndpointSet::new(
            proto.write_endpoints.iter().cloned(),
            proto.read_endpoints.iter().cloned(),
        )
    }

    pub fn classify(&self, endpoint: &str) -> Classification {
        if self.write.contains(endpoint) {
            Classification::Write
        } else if self.read.contains(endpoint) {
            Classification::Read
        } else {
            Classification::Unknown
        }
    }

    /// True until discovery has produced at least one endpoint.
    pub fn is_empty(&self) -> bool {
        self.write.is_empty() && self.read.is_empty()
    }

    pub fn to_proto(&self) -> EndpointsProto {
        let mut write: Vec<String> = self.write.iter().cloned().collect();
        let mut read: Vec<String> = self.read.iter().cloned().collect();
        write.sort();
        read.sort();
        EndpointsProto {
            write_endpoints: write,
            read_endpoints: read,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sets() -> EndpointSet {
        EndpointSet::new(
            vec!["/index".to_string(), "/delete".to_string()],
            vec!["/search".to_string()],
        )
    }

    #[test]
    fn classifies_writes_reads_and_unknown() {
        let set = sets();
        assert_eq!(set.classify("/index"), Classification::Write);
        assert_eq!(set.classify("/delete"), Classification::Write);
        assert_eq!(set.classify("/search"), Classification::Read);
        assert_eq!(set.classify("/unknown"), Classification::Unknown);
    }

    #[test]
    fn empty_set_rejects_everything() {
        let set = EndpointSet::default();
        assert!(set.is_empty());
        assert_eq!(set.classify("/index"), Classification::Unknown);
    }

    #[test]
    fn overlap_is_kept_on_the_write_side() {
        let set = EndpointSet::new(
            vec!["/both".to_string()],
            vec!["/both".to_string(), "/search".to_string()],
        );
        assert_eq!(set.classify("/both"), Classification::Write);
        assert_eq!(set.classify("/search"), Classification::Read);
    }

    #[test]
    fn proto_round_trip_is_sorted() {
        let proto = sets().to_proto();
        assert_eq!(proto.write_endpoints, vec!["/delete", "/index"]);
        assert_eq!(proto.read_endpoints, vec!["/search"]);
        assert_eq!(EndpointSet::from_proto(&proto), sets());
    }
}
