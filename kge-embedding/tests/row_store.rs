use kge_embedding::{Device, EmbeddingTable};
use ndarray::{array, Array2};

#[test]
fn test_new_table_is_zeroed() {
    let table = EmbeddingTable::new(6, 3, Device::Cpu).unwrap();
    assert_eq!(table.num_embeddings(), 6);
    assert_eq!(table.dim(), 3);
    assert_eq!(table.step(), 0);
    assert_eq!(table.to_array().unwrap(), Array2::<f32>::zeros((6, 3)));
    assert!(table.accumulator().iter().all(|v| *v == 0.0));
}

#[test]
fn test_zero_dim_rejected() {
    assert!(EmbeddingTable::new(4, 0, Device::Cpu).is_err());
}

#[test]
fn test_write_and_gather() {
    let table = EmbeddingTable::new(5, 2, Device::Cpu).unwrap();
    table
        .write_rows(&[1, 3], array![[1.0, 2.0], [3.0, 4.0]].view())
        .unwrap();
    let rows = table.gather(&[3, 1, 0, 3]).unwrap();
    assert_eq!(rows, array![[3.0, 4.0], [1.0, 2.0], [0.0, 0.0], [3.0, 4.0]]);
    assert_eq!(table.row(1).unwrap(), vec![1.0, 2.0]);
}

#[test]
fn test_gather_empty() {
    let table = EmbeddingTable::new(5, 2, Device::Cpu).unwrap();
    assert_eq!(table.gather(&[]).unwrap().dim(), (0, 2));
}

#[test]
fn test_scatter_add() {
    let table = EmbeddingTable::new(4, 2, Device::Cpu).unwrap();
    table
        .write_rows(&[0, 2], array![[1.0, 1.0], [2.0, 2.0]].view())
        .unwrap();
    table
        .scatter_add(&[2, 0], array![[0.5, -0.5], [1.0, 0.0]].view())
        .unwrap();
    assert_eq!(table.row(0).unwrap(), vec![2.0, 1.0]);
    assert_eq!(table.row(2).unwrap(), vec![2.5, 1.5]);
    assert_eq!(table.row(1).unwrap(), vec![0.0, 0.0]);
}

#[test]
fn test_out_of_range_index() {
    let table = EmbeddingTable::new(4, 2, Device::Cpu).unwrap();
    let err = table.gather(&[1, 4]).unwrap_err();
    assert!(err.to_string().contains("out of range"));
    assert!(table.row(9).is_err());
    assert!(table
        .scatter_add(&[7], array![[1.0, 1.0]].view())
        .is_err());
}

#[test]
fn test_batch_shape_mismatch() {
    let table = EmbeddingTable::new(4, 2, Device::Cpu).unwrap();
    assert!(table
        .write_rows(&[0, 1], array![[1.0, 1.0]].view())
        .is_err());
    assert!(table
        .scatter_add(&[0], array![[1.0, 1.0, 1.0]].view())
        .is_err());
}

#[test]
fn test_init_within_range() {
    let table = EmbeddingTable::new(50, 8, Device::Cpu).unwrap();
    table.init(0.25, 42).unwrap();
    let values = table.to_array().unwrap();
    assert!(values.iter().all(|v| (-0.25..=0.25).contains(v)));
    assert!(values.iter().any(|v| *v != 0.0));

    let other = EmbeddingTable::new(50, 8, Device::Cpu).unwrap();
    other.init(0.25, 42).unwrap();
    assert_eq!(other.to_array().unwrap(), values);

    assert!(table.init(-1.0, 0).is_err());
}

#[test]
fn test_load_emb_shape_checked() {
    let table = EmbeddingTable::new(2, 2, Device::Gpu(0)).unwrap();
    table.load_emb(array![[1.0, 2.0], [3.0, 4.0]].view()).unwrap();
    assert_eq!(table.to_array().unwrap(), array![[1.0, 2.0], [3.0, 4.0]]);
    assert!(table.load_emb(array![[1.0, 2.0]].view()).is_err());
    assert_eq!(table.device(), Device::Gpu(0));
}

#[test]
fn test_device_ids() {
    assert_eq!(Device::from_gpu_id(-1), Device::Cpu);
    assert_eq!(Device::from_gpu_id(2), Device::Gpu(2));
    assert_eq!(Device::Gpu(2).gpu_id(), 2);
    assert_eq!(Device::Cpu.gpu_id(), -1);
    assert_eq!(Device::Gpu(1).to_string(), "cuda:1");
    assert_eq!(Device::Cpu.to_string(), "cpu");
}
