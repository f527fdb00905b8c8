use kge_embedding::{Device, EmbeddingTable, ExternalEmbedding};
use kge_structs::config::EmbeddingConfig;
use ndarray::{array, Array2};
use std::sync::Arc;

fn partitioned() -> (ExternalEmbedding, Arc<EmbeddingTable>) {
    let mut emb = ExternalEmbedding::new(&EmbeddingConfig::new(0.1), 4, 2).unwrap();
    let host = Arc::new(EmbeddingTable::new(4, 2, Device::Cpu).unwrap());
    host.write_rows(&[1, 3], array![[1.0, 1.0], [3.0, 3.0]].view())
        .unwrap();
    emb.setup_cross_rels(&[3, 1, 3], host.clone()).unwrap();
    (emb, host)
}

#[test]
fn test_read_refreshes_mirror() {
    let (mut emb, _) = partitioned();
    assert!(emb.has_cross_rel());
    assert_eq!(emb.table().row(3).unwrap(), vec![0.0, 0.0]);

    let rows = emb.read(&[0, 3], None, false).unwrap();
    assert_eq!(rows.values(), &array![[0.0, 0.0], [3.0, 3.0]]);
    assert_eq!(emb.table().row(3).unwrap(), vec![3.0, 3.0]);
    assert_eq!(emb.table().row(1).unwrap(), vec![0.0, 0.0]);
}

#[test]
fn test_update_reaches_authoritative_rows() {
    let (mut emb, host) = partitioned();
    let rows = emb.read(&[0, 1], None, true).unwrap();
    rows.traced().unwrap().set_grad(Array2::ones((2, 2))).unwrap();
    emb.update(None).unwrap();

    let expected = 1.0 - 0.1 / (1.0 + 1e-10);
    assert_eq!(host.row(1).unwrap(), emb.table().row(1).unwrap());
    assert!((host.row(1).unwrap()[0] - expected).abs() < 1e-6);
    assert!((host.accumulator_value(1) - 1.0).abs() < 1e-6);
    assert_eq!(host.accumulator_value(0), 0.0);
    assert_eq!(host.row(0).unwrap(), vec![0.0, 0.0]);
}

#[test]
fn test_async_update_reaches_authoritative_rows() {
    let (mut emb, host) = partitioned();
    emb.create_async_update(1).unwrap();
    let rows = emb.read(&[3], None, true).unwrap();
    rows.traced().unwrap().set_grad(Array2::ones((1, 2))).unwrap();
    emb.update(None).unwrap();
    emb.finish_async_update().unwrap();
    assert!((host.row(3).unwrap()[0] - (3.0 - 0.1)).abs() < 1e-6);
}

#[test]
fn test_setup_checks() {
    let mut emb = ExternalEmbedding::new(&EmbeddingConfig::new(0.1), 4, 2).unwrap();
    let wrong_shape = Arc::new(EmbeddingTable::new(4, 3, Device::Cpu).unwrap());
    assert!(emb.setup_cross_rels(&[1], wrong_shape).is_err());

    let own_table = emb.table().clone();
    let err = emb.setup_cross_rels(&[1], own_table).unwrap_err();
    assert!(err.to_string().contains("separate"));
    assert!(!emb.has_cross_rel());

    let host = Arc::new(EmbeddingTable::new(4, 2, Device::Cpu).unwrap());
    assert!(emb.setup_cross_rels(&[4], host.clone()).is_err());

    emb.create_async_update(1).unwrap();
    assert!(emb.setup_cross_rels(&[1], host).is_err());
    emb.finish_async_update().unwrap();
}
