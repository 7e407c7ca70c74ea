use std::sync::Arc;

use radex::cluster::{
    decode_cluster, encode_cluster, ClusterPayload, ValueRecord, LOWEST_CLUSTER_MAGIC,
};
use radex::{Backend, Error, IndexConfig, MemBackend, RadixIndex};

const CLUSTER: usize = 4096;

#[test]
fn framed_clusters_survive_the_backend() {
    let backend = MemBackend::new(CLUSTER);

    let lowest = ClusterPayload::Lowest(vec![
        ValueRecord {
            key_start: 0,
            value: 0xBEEFDEAD,
        },
        ValueRecord {
            key_start: 0x100,
            value: 0xBEEFDEAE,
        },
    ]);
    let mid = ClusterPayload::Mid(vec![CLUSTER as u64, 0, 2 * CLUSTER as u64]);
    let root = ClusterPayload::Root(vec![3 * CLUSTER as u64]);

    for (offset, payload) in [(0u64, &root), (CLUSTER as u64, &mid), (2 * CLUSTER as u64, &lowest)]
    {
        let bytes = encode_cluster(payload, CLUSTER).unwrap();
        backend.write_cluster(offset, &bytes).unwrap();
    }
    assert_eq!(backend.cluster_count(), 3);

    for (offset, payload) in [(0u64, &root), (CLUSTER as u64, &mid), (2 * CLUSTER as u64, &lowest)]
    {
        let mut buf = vec![0u8; CLUSTER];
        assert_eq!(backend.read_cluster(offset, &mut buf).unwrap(), CLUSTER);
        assert_eq!(&decode_cluster(&buf).unwrap(), payload);
    }
}

#[test]
fn bit_rot_on_the_device_is_detected() {
    let backend = MemBackend::new(CLUSTER);
    let payload = ClusterPayload::Lowest(vec![ValueRecord {
        key_start: 42,
        value: 43,
    }]);
    let mut bytes = encode_cluster(&payload, CLUSTER).unwrap();
    assert_eq!(
        u64::from_ne_bytes(bytes[..8].try_into().unwrap()),
        LOWEST_CLUSTER_MAGIC
    );

    bytes[20] ^= 0x80;
    backend.write_cluster(0, &bytes).unwrap();

    let mut buf = vec![0u8; CLUSTER];
    backend.read_cluster(0, &mut buf).unwrap();
    assert_eq!(decode_cluster(&buf).unwrap_err(), Error::IoFailure);
}

#[test]
fn index_carries_its_cluster_geometry() {
    let idx = RadixIndex::new(IndexConfig::default(), Arc::new(MemBackend::new(CLUSTER))).unwrap();
    // Default cluster size frames one node of the larger pool.
    assert!(idx.cluster_size() > 0);
    assert_eq!(idx.save().unwrap_err(), Error::Unimplemented);
    assert_eq!(idx.load(0).unwrap_err(), Error::Unimplemented);
}
