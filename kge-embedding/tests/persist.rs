use kge_embedding::{Device, EmbeddingTable, ExternalEmbedding, InferEmbedding};
use kge_structs::config::EmbeddingConfig;
use ndarray::{array, Array2};

#[test]
fn test_save_and_load_exact() {
    let dir = tempfile::tempdir().unwrap();
    let table = EmbeddingTable::new(7, 5, Device::Cpu).unwrap();
    table.init(0.3, 99).unwrap();
    table.save(dir.path(), "entity").unwrap();
    assert!(dir.path().join("entity.bin").exists());
    assert!(dir.path().join("entity.json").exists());

    let restored = EmbeddingTable::new(7, 5, Device::Cpu).unwrap();
    restored.load(dir.path(), "entity").unwrap();
    let a = table.to_array().unwrap();
    let b = restored.to_array().unwrap();
    assert!(a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()));

    let opened = EmbeddingTable::open(dir.path(), "entity", Device::Gpu(0)).unwrap();
    assert_eq!(opened.to_array().unwrap(), a);
    assert_eq!(opened.device(), Device::Gpu(0));
}

#[test]
fn test_load_shape_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    EmbeddingTable::new(3, 2, Device::Cpu)
        .unwrap()
        .save(dir.path(), "relation")
        .unwrap();
    let other = EmbeddingTable::new(3, 4, Device::Cpu).unwrap();
    let err = other.load(dir.path(), "relation").unwrap_err();
    assert!(err.to_string().contains("shape"));
    assert!(other.load(dir.path(), "missing").is_err());
}

#[test]
fn test_truncated_rows_rejected() {
    let dir = tempfile::tempdir().unwrap();
    EmbeddingTable::new(3, 2, Device::Cpu)
        .unwrap()
        .save(dir.path(), "entity")
        .unwrap();
    std::fs::write(dir.path().join("entity.bin"), [0u8; 8]).unwrap();
    assert!(EmbeddingTable::open(dir.path(), "entity", Device::Cpu).is_err());
}

#[test]
fn test_state_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut emb = ExternalEmbedding::new(&EmbeddingConfig::new(0.1), 4, 2).unwrap();
    let rows = emb.read(&[0, 2], None, true).unwrap();
    rows.traced().unwrap().set_grad(array![[1.0, 1.0], [2.0, 2.0]]).unwrap();
    emb.update(None).unwrap();
    emb.save(dir.path(), "entity").unwrap();
    emb.table().save_state(dir.path(), "entity").unwrap();

    let restored = EmbeddingTable::new(4, 2, Device::Cpu).unwrap();
    restored.load(dir.path(), "entity").unwrap();
    restored.load_state(dir.path(), "entity").unwrap();
    assert_eq!(restored.accumulator(), emb.table().accumulator());
    assert_eq!(restored.step(), 1);
    assert_eq!(restored.to_array().unwrap(), emb.table().to_array().unwrap());

    let smaller = EmbeddingTable::new(3, 2, Device::Cpu).unwrap();
    assert!(smaller.load_state(dir.path(), "entity").is_err());
}

#[test]
fn test_infer_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let table = EmbeddingTable::new(3, 2, Device::Cpu).unwrap();
    table
        .load_emb(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]].view())
        .unwrap();
    table.save(dir.path(), "entity").unwrap();

    let infer = InferEmbedding::load(dir.path(), "entity", Device::Cpu).unwrap();
    assert_eq!(infer.num_embeddings(), 3);
    assert_eq!(infer.dim(), 2);
    assert_eq!(infer.lookup(&[2, 0]).unwrap(), array![[5.0, 6.0], [1.0, 2.0]]);
    assert!(infer.lookup(&[3]).is_err());

    let in_memory = InferEmbedding::from_array(Array2::<f32>::ones((2, 2)), Device::Gpu(1));
    assert_eq!(in_memory.device(), Device::Gpu(1));
    assert_eq!(in_memory.lookup(&[1]).unwrap(), Array2::<f32>::ones((1, 2)));
}
