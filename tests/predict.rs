//! Batch, in-place, single-row and leaf prediction through `CpuPredictor`.
//!
//! Test cases organized by:
//! - Fixed scenarios with hand-computed outputs
//! - Agreement between input paths (pages, adapters, single rows)
//! - Scheduling parameters (block size, thread count, paging)
//! - Error and fallback behavior

mod support;

use std::io;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use approx::assert_abs_diff_eq;
use proptest::prelude::*;
use rstest::rstest;
use tracing_subscriber::fmt::MakeWriter;

use forest_infer::data::{CsrAdapter, DataSource, DenseAdapter, Entry, InplaceInput, SparseDataset};
use forest_infer::predict::{AdapterView, RowCursor, RowSource, UnrollBuffer};
use forest_infer::repr::gbdt::{Forest, Tree, TreeBuilder, TreeRange};
use forest_infer::{CpuPredictor, InplaceOutcome, PredictError, PredictorConfig};

use support::{dataset, random_dense, random_forest};

fn config(block_size: usize, n_threads: usize) -> PredictorConfig {
    PredictorConfig::builder()
        .block_size(block_size)
        .maybe_n_threads(NonZeroUsize::new(n_threads))
        .build()
        .unwrap()
}

fn inplace(predictor: &CpuPredictor<'_>, input: InplaceInput<'_>, base_margin: Option<&[f32]>) -> Vec<f32> {
    let mut out = Vec::new();
    let outcome = predictor
        .inplace_predict(input, f32::NAN, base_margin, TreeRange::all(), &mut out)
        .unwrap();
    assert_eq!(outcome, InplaceOutcome::Handled);
    out
}

// =============================================================================
// Fixed scenarios
// =============================================================================

#[test]
fn two_leaf_trees_sum_with_base_score() {
    let mut forest = Forest::for_regression(2).with_base_score(0.1);
    forest.push_tree(Tree::leaf(1.5), 0);
    forest.push_tree(Tree::leaf(-0.5), 0);
    let predictor = CpuPredictor::new(&forest).unwrap();

    let data = SparseDataset::from_rows(2, [vec![Entry::new(0, 3.0)], vec![], vec![Entry::new(1, -2.0)]]);
    let batch = predictor.predict(&data, TreeRange::all()).unwrap();
    for &p in &batch {
        assert_abs_diff_eq!(p, 1.1, epsilon = 1e-6);
    }

    let single = predictor.predict_instance(&[Entry::new(0, 3.0)], 0);
    assert_abs_diff_eq!(single[0], 1.1, epsilon = 1e-6);

    let values = [3.0, f32::NAN];
    let adapter = DenseAdapter::new(&values, 1, 2).unwrap();
    assert_abs_diff_eq!(inplace(&predictor, adapter.into(), None)[0], 1.1, epsilon = 1e-6);
}

#[rstest]
#[case(0.0, 0.0)]
#[case(2.5, 0.5)]
#[case(-1.0, 3.0)]
fn root_leaf_is_identical_across_modes(#[case] value: f32, #[case] base_score: f32) {
    let mut forest = Forest::for_regression(3).with_base_score(base_score);
    forest.push_tree(Tree::leaf(value), 0);
    let predictor = CpuPredictor::new(&forest).unwrap();

    let values = random_dense(7, 5, 3, 0.3);
    let expected = value + base_score;

    let batch = predictor.predict(&dataset(&values, 5, 3), TreeRange::all()).unwrap();
    let adapter = DenseAdapter::new(&values, 5, 3).unwrap();
    let inplace = inplace(&predictor, adapter.into(), None);
    let single = predictor.predict_instance(&[], 0);

    assert!(batch.iter().chain(&inplace).chain(&single).all(|&p| p == expected));
}

#[test]
fn single_block_writes_each_cell_once() {
    let mut forest = Forest::new(1, 2);
    forest.push_tree(Tree::leaf(1.0), 0);
    forest.push_tree(Tree::leaf(1.0), 1);
    let predictor = CpuPredictor::with_config(&forest, config(64, 0)).unwrap();

    let data = SparseDataset::from_rows(1, [[Entry::new(0, 1.0)], [Entry::new(0, 2.0)], [Entry::new(0, 3.0)]]);
    let mut out = vec![0.0; 3 * 2];
    predictor.predict_batch(&data, &mut out, TreeRange::all()).unwrap();
    assert_eq!(out, vec![1.0; 6]);
}

#[test]
fn repeated_calls_are_identical() {
    let forest = random_forest(11, 6, 3, 12, 3);
    let predictor = CpuPredictor::new(&forest).unwrap();
    let values = random_dense(12, 150, 6, 0.2);
    let data = dataset(&values, 150, 6);

    let first = predictor.predict(&data, TreeRange::all()).unwrap();
    let second = predictor.predict(&data, TreeRange::all()).unwrap();
    assert_eq!(first, second);
}

// =============================================================================
// Input paths agree
// =============================================================================

#[test]
fn inplace_layouts_match_batch() {
    let forest = random_forest(21, 5, 2, 10, 4);
    let predictor = CpuPredictor::new(&forest).unwrap();
    let n_rows = 130;
    let values = random_dense(22, n_rows, 5, 0.25);
    let batch = predictor.predict(&dataset(&values, n_rows, 5), TreeRange::all()).unwrap();

    let dense = DenseAdapter::new(&values, n_rows, 5).unwrap();
    assert_eq!(inplace(&predictor, dense.into(), None), batch);

    // Column-major storage read through a transposed view.
    let array = ndarray::ArrayView2::from_shape((n_rows, 5), &values[..]).unwrap();
    let col_major = array.t().as_standard_layout().into_owned();
    assert_eq!(inplace(&predictor, col_major.t().into(), None), batch);

    let mut indptr = vec![0];
    let mut indices = Vec::new();
    let mut stored = Vec::new();
    for row in values.chunks(5) {
        for (c, &v) in row.iter().enumerate() {
            if !v.is_nan() {
                indices.push(c as u32);
                stored.push(v);
            }
        }
        indptr.push(stored.len());
    }
    let csr = CsrAdapter::new(&indptr, &indices, &stored, 5).unwrap();
    assert_eq!(inplace(&predictor, csr.into(), None), batch);

    // Signed 64-bit CSR arrays through the generic adapter entry point.
    let indptr64: Vec<i64> = indptr.iter().map(|&p| p as i64).collect();
    let indices64: Vec<i64> = indices.iter().map(|&c| i64::from(c)).collect();
    let csr64 = CsrAdapter::new(&indptr64, &indices64, &stored, 5).unwrap();
    let mut out = Vec::new();
    predictor
        .predict_adapter(&csr64, f32::NAN, None, TreeRange::all(), &mut out)
        .unwrap();
    assert_eq!(out, batch);
}

#[test]
fn csr_with_out_of_range_column_is_rejected() {
    let indptr = [0usize, 2];
    let values = [0.5, 0.5];
    // Column 5 does not exist in a 5-column layout.
    assert!(CsrAdapter::new(&indptr, &[1u32, 5], &values, 5).is_none());
}

#[test]
fn inplace_filters_missing_marker() {
    let mut builder = TreeBuilder::new();
    builder.add_split(0, 0.5, false, 1, 2);
    builder.add_leaf(-1.0);
    builder.add_leaf(1.0);
    let mut forest = Forest::for_regression(1);
    forest.push_tree(builder.build(), 0);
    let predictor = CpuPredictor::new(&forest).unwrap();

    // 0.0 would go left, but as the missing marker it takes the default (right).
    let values = [0.0, 0.25];
    let adapter = DenseAdapter::new(&values, 2, 1).unwrap();
    let mut out = Vec::new();
    predictor
        .inplace_predict(adapter.into(), 0.0, None, TreeRange::all(), &mut out)
        .unwrap();
    assert_eq!(out, vec![1.0, -1.0]);
}

#[test]
fn inplace_uses_base_margin() {
    let mut forest = Forest::new(1, 2);
    forest.push_tree(Tree::leaf(1.0), 1);
    let predictor = CpuPredictor::new(&forest).unwrap();

    let values = [0.5, 0.5];
    let adapter = DenseAdapter::new(&values, 2, 1).unwrap();
    let out = inplace(&predictor, adapter.into(), Some(&[0.1, 0.2, 0.3, 0.4]));
    assert_eq!(out, vec![0.1, 1.2, 0.3, 1.4]);
}

#[test]
fn instance_matches_batch_rows() {
    let forest = random_forest(31, 4, 3, 9, 3);
    let predictor = CpuPredictor::new(&forest).unwrap();
    let values = random_dense(32, 40, 4, 0.3);
    let data = dataset(&values, 40, 4);
    let batch = predictor.predict(&data, TreeRange::all()).unwrap();

    let page = data.pages().next().unwrap();
    for (r, row) in page.rows().enumerate() {
        assert_eq!(predictor.predict_instance(row, 0), &batch[r * 3..r * 3 + 3]);
    }
}

#[test]
fn instance_tree_limit_counts_rounds() {
    let forest = random_forest(33, 4, 3, 9, 2);
    let predictor = CpuPredictor::new(&forest).unwrap();
    let values = random_dense(34, 1, 4, 0.0);
    let data = dataset(&values, 1, 4);
    let row = data.pages().next().unwrap().row(0).to_vec();

    // Two rounds of three groups = the first six trees.
    let expected = predictor.predict(&data, TreeRange::first(6)).unwrap();
    assert_eq!(predictor.predict_instance(&row, 2), expected);
    assert_eq!(predictor.predict_instance(&row, 100), predictor.predict_instance(&row, 0));
}

// =============================================================================
// Scheduling
// =============================================================================

#[rstest]
fn block_size_and_threads_do_not_change_results(
    #[values(1, 3, 64, 500)] block_size: usize,
    #[values(1, 2, 4)] n_threads: usize,
) {
    let forest = random_forest(41, 8, 2, 16, 4);
    let n_rows = 257;
    let values = random_dense(42, n_rows, 8, 0.15);
    let data = dataset(&values, n_rows, 8);

    let reference = CpuPredictor::with_config(&forest, config(64, 1)).unwrap();
    let expected = reference.predict(&data, TreeRange::all()).unwrap();
    let expected_leaves = reference.predict_leaf(&data, 0);

    let predictor = CpuPredictor::with_config(&forest, config(block_size, n_threads)).unwrap();
    assert_eq!(predictor.predict(&data, TreeRange::all()).unwrap(), expected);
    assert_eq!(predictor.predict_leaf(&data, 0), expected_leaves);

    let adapter = DenseAdapter::new(&values, n_rows, 8).unwrap();
    assert_eq!(inplace(&predictor, adapter.into(), None), expected);
}

#[test]
fn predictions_nest_inside_rayon_jobs() {
    use rayon::prelude::*;

    let forest = random_forest(43, 6, 2, 10, 3);
    let n_rows = 200;
    let values = random_dense(44, n_rows, 6, 0.1);
    let data = dataset(&values, n_rows, 6);
    let adapter = DenseAdapter::new(&values, n_rows, 6).unwrap();

    // Auto thread count: calls run on whichever pool they are issued from.
    let predictor = CpuPredictor::with_config(&forest, config(16, 0)).unwrap();
    let expected = predictor.predict(&data, TreeRange::all()).unwrap();

    let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
    let results: Vec<(Vec<f32>, Vec<f32>)> = pool.install(|| {
        (0..64)
            .into_par_iter()
            .map(|_| {
                let batch = predictor.predict(&data, TreeRange::all()).unwrap();
                (batch, inplace(&predictor, adapter.into(), None))
            })
            .collect()
    });

    assert_eq!(results.len(), 64);
    for (batch, in_place) in results {
        assert_eq!(batch, expected);
        assert_eq!(in_place, expected);
    }
}

#[test]
fn concurrent_callers_share_one_predictor() {
    let forest = random_forest(45, 5, 3, 9, 3);
    let n_rows = 120;
    let values = random_dense(46, n_rows, 5, 0.2);
    let data = dataset(&values, n_rows, 5);
    let predictor = CpuPredictor::with_config(&forest, config(8, 2)).unwrap();
    let expected = predictor.predict(&data, TreeRange::all()).unwrap();

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| predictor.predict(&data, TreeRange::all()).unwrap()))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    });
}

#[rstest]
#[case(1)]
#[case(7)]
#[case(64)]
#[case(1000)]
fn paged_dataset_matches_single_page(#[case] page_size: usize) {
    let forest = random_forest(51, 5, 3, 12, 3);
    let predictor = CpuPredictor::new(&forest).unwrap();
    let values = random_dense(52, 150, 5, 0.2);
    let margin: Vec<f32> = (0..150 * 3).map(|i| i as f32 * 0.01).collect();

    let single = dataset(&values, 150, 5).with_base_margin(margin.clone());
    let paged = dataset(&values, 150, 5).with_base_margin(margin).with_page_size(page_size);
    assert_eq!(paged.n_pages(), 150usize.div_ceil(page_size));

    assert_eq!(
        predictor.predict(&paged, TreeRange::all()).unwrap(),
        predictor.predict(&single, TreeRange::all()).unwrap()
    );
    assert_eq!(predictor.predict_leaf(&paged, 5), predictor.predict_leaf(&single, 5));
}

#[test]
fn unroll_window_keeps_row_until_wraparound() {
    let values: Vec<f32> = (0..10).map(|i| i as f32).collect();
    let adapter = DenseAdapter::new(&values, 10, 1).unwrap();
    let unroll = UnrollBuffer::new(1, 8, 1);
    let view = AdapterView::new(&adapter, f32::NAN, &unroll);
    let mut cursor = view.cursor();

    let row0 = cursor.row(0).to_vec();
    assert_eq!(row0, vec![Entry::new(0, 0.0)]);
    for i in 1..8 {
        cursor.row(i);
    }
    assert_eq!(cursor.slot(0), &row0[..]);

    // Row 8 reuses slot 0 only after the window has wrapped.
    cursor.row(8);
    assert_eq!(cursor.slot(0), &[Entry::new(0, 8.0)]);
}

// =============================================================================
// Leaf indices
// =============================================================================

#[test]
fn leaf_limit_zero_means_all_trees() {
    let forest = random_forest(61, 4, 2, 6, 3);
    let predictor = CpuPredictor::new(&forest).unwrap();
    let values = random_dense(62, 20, 4, 0.1);
    let data = dataset(&values, 20, 4);

    let all = predictor.predict_leaf(&data, 0);
    assert_eq!(all.len(), 20 * 6);
    assert_eq!(all, predictor.predict_leaf(&data, 6));
    assert_eq!(all, predictor.predict_leaf(&data, 60));

    let first_two = predictor.predict_leaf(&data, 2);
    assert_eq!(first_two.len(), 20 * 2);
    for (row_all, row_two) in all.chunks(6).zip(first_two.chunks(2)) {
        assert_eq!(&row_all[..2], row_two);
        // Depth-3 complete trees have leaves at ids 7..15.
        assert!(row_all.iter().all(|&leaf| (7.0..15.0).contains(&leaf)));
    }
}

// =============================================================================
// Base margin
// =============================================================================

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn short_base_margin_falls_back_with_warning() {
    let forest = random_forest(71, 3, 1, 4, 2);
    let predictor = CpuPredictor::new(&forest).unwrap();
    let values = random_dense(72, 10, 3, 0.0);

    let expected = predictor.predict(&dataset(&values, 10, 3), TreeRange::all()).unwrap();
    let data = dataset(&values, 10, 3).with_base_margin(vec![100.0; 9]);

    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let preds = tracing::subscriber::with_default(subscriber, || predictor.predict(&data, TreeRange::all())).unwrap();

    assert_eq!(preds, expected);
    let logs = logs.contents();
    assert!(logs.contains("WARN"), "no warning emitted: {logs}");
    assert!(logs.contains("expected=10"), "{logs}");
    assert!(logs.contains("actual=9"), "{logs}");
}

#[test]
fn matching_base_margin_replaces_base_score() {
    let mut forest = Forest::for_regression(1).with_base_score(10.0);
    forest.push_tree(Tree::leaf(1.0), 0);
    let predictor = CpuPredictor::new(&forest).unwrap();

    let data = SparseDataset::from_rows(1, [[Entry::new(0, 0.0)], [Entry::new(0, 0.0)]]).with_base_margin(vec![-1.0, 2.0]);
    assert_eq!(predictor.predict(&data, TreeRange::all()).unwrap(), vec![0.0, 3.0]);
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn model_checks_happen_at_construction() {
    let forest = Forest::for_regression(1).with_leaf_vector_size(3);
    assert!(matches!(CpuPredictor::new(&forest), Err(PredictError::LeafVectorUnsupported(3))));

    let forest = Forest::new(1, 0);
    assert!(matches!(CpuPredictor::new(&forest), Err(PredictError::ZeroOutputGroups)));

    let mut forest = Forest::for_regression(1);
    let mut builder = TreeBuilder::new();
    builder.add_split(4, 0.5, true, 1, 2);
    builder.add_leaf(0.0);
    builder.add_leaf(1.0);
    forest.push_tree(builder.build(), 0);
    assert!(matches!(CpuPredictor::new(&forest), Err(PredictError::InvalidModel(_))));
}

#[test]
fn invalid_tree_range_is_rejected() {
    let forest = random_forest(81, 2, 1, 3, 1);
    let predictor = CpuPredictor::new(&forest).unwrap();
    let data = dataset(&random_dense(82, 2, 2, 0.0), 2, 2);

    assert_eq!(
        predictor.predict(&data, TreeRange::new(0, 4)),
        Err(PredictError::InvalidTreeRange { begin: 0, end: 4, n_trees: 3 })
    );
    assert_eq!(
        predictor.predict(&data, TreeRange::new(3, 2)),
        Err(PredictError::InvalidTreeRange { begin: 3, end: 2, n_trees: 3 })
    );
}

#[test]
fn inplace_column_mismatch_is_fatal() {
    let forest = random_forest(91, 3, 1, 2, 1);
    let predictor = CpuPredictor::new(&forest).unwrap();
    let values = [0.0; 8];
    let adapter = DenseAdapter::new(&values, 2, 4).unwrap();

    let mut out = vec![1.0];
    let result = predictor.inplace_predict(adapter.into(), f32::NAN, None, TreeRange::all(), &mut out);
    assert_eq!(result, Err(PredictError::FeatureCountMismatch { model: 3, data: 4 }));
    assert_eq!(out, vec![1.0]);
}

#[test]
fn foreign_input_is_declined() {
    let forest = random_forest(92, 3, 1, 2, 1);
    let predictor = CpuPredictor::new(&forest).unwrap();
    let handle = 42u64;

    let mut out = vec![1.0, 2.0];
    let outcome = predictor
        .inplace_predict(InplaceInput::Foreign(&handle), f32::NAN, None, TreeRange::all(), &mut out)
        .unwrap();
    assert_eq!(outcome, InplaceOutcome::Declined);
    assert_eq!(out, vec![1.0, 2.0]);
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prediction_is_base_score_plus_tree_sum(
        seed in any::<u64>(),
        n_rows in 1usize..90,
        n_groups in 1usize..4,
    ) {
        let n_trees = 2 * n_groups + 1;
        let forest = random_forest(seed, 4, n_groups, n_trees, 3);
        let predictor = CpuPredictor::new(&forest).unwrap();
        let values = random_dense(seed ^ 0xABCD, n_rows, 4, 0.2);
        let data = dataset(&values, n_rows, 4);

        let total = predictor.predict(&data, TreeRange::all()).unwrap();
        let mut summed = vec![forest.base_score(); n_rows * n_groups];
        for t in 0..n_trees {
            let single = predictor.predict(&data, TreeRange::new(t, t + 1)).unwrap();
            for (acc, p) in summed.iter_mut().zip(&single) {
                *acc += p - forest.base_score();
            }
        }
        for (a, b) in total.iter().zip(&summed) {
            prop_assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }
}
