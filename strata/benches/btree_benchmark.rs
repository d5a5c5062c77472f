use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use strata::btree::BTreeFile;
use strata::catalog::DbFile;
use strata::tuple::{Field, FieldType, IndexPredicate, Op, Tuple, TupleDesc};
use strata::{Database, TransactionId};
use tempfile::TempDir;

fn setup_test_db(keys: i32) -> (TempDir, Database, Arc<BTreeFile>) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new();
    let td = TupleDesc::new(vec![FieldType::Int, FieldType::Int]);
    let file = BTreeFile::open(temp_dir.path().join("bench.dat"), 0, td).unwrap();
    db.catalog().add_table(Arc::clone(&file) as Arc<dyn DbFile>);

    let tid = TransactionId::new();
    for key in 0..keys {
        db.buffer_pool()
            .insert_tuple(
                &db,
                tid,
                file.table_id(),
                Tuple::new(vec![Field::Int(key), Field::Int(key * 10)]),
            )
            .unwrap();
    }
    db.buffer_pool().transaction_complete(&db, tid, true).unwrap();

    (temp_dir, db, file)
}

fn benchmark_point_lookup(c: &mut Criterion) {
    let (_dir, db, file) = setup_test_db(10_000);

    c.bench_function("point_lookup", |b| {
        b.iter(|| {
            let tid = TransactionId::new();
            let predicate = IndexPredicate::new(Op::Equals, Field::Int(black_box(7_321)));
            let found = file
                .index_iterator(&db, tid, predicate)
                .unwrap()
                .next()
                .unwrap()
                .unwrap();
            db.buffer_pool().transaction_complete(&db, tid, true).unwrap();
            found
        })
    });
}

fn benchmark_full_scan(c: &mut Criterion) {
    let (_dir, db, file) = setup_test_db(10_000);

    c.bench_function("full_scan", |b| {
        b.iter(|| {
            let tid = TransactionId::new();
            let count = file.iterator(&db, tid).unwrap().count();
            db.buffer_pool().transaction_complete(&db, tid, true).unwrap();
            count
        })
    });
}

fn benchmark_insert_delete(c: &mut Criterion) {
    let (_dir, db, file) = setup_test_db(1_000);

    c.bench_function("insert_delete", |b| {
        b.iter(|| {
            let tid = TransactionId::new();
            db.buffer_pool()
                .insert_tuple(
                    &db,
                    tid,
                    file.table_id(),
                    Tuple::new(vec![Field::Int(black_box(500)), Field::Int(0)]),
                )
                .unwrap();
            db.buffer_pool().transaction_complete(&db, tid, true).unwrap();

            let tid = TransactionId::new();
            let victim = file
                .index_iterator(&db, tid, IndexPredicate::new(Op::Equals, Field::Int(500)))
                .unwrap()
                .next()
                .unwrap()
                .unwrap();
            db.buffer_pool().delete_tuple(&db, tid, &victim).unwrap();
            db.buffer_pool().transaction_complete(&db, tid, true).unwrap();
        })
    });
}

criterion_group!(
    benches,
    benchmark_point_lookup,
    benchmark_full_scan,
    benchmark_insert_delete
);
criterion_main!(benches);
