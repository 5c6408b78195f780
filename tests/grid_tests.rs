//! Cross-thread tests of the worker grid: one OS thread per rank over the
//! in-process backend, exercising the same collective sequences the trainer
//! issues.

use candle_core::{Device, Tensor};
use splatgrid::distributed::{GridShape, WorkerContext};
use std::thread;

/// Run one closure per rank and collect the results in rank order.
fn run_grid<T, F>(grid: GridShape, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(WorkerContext) -> T + Send + Sync + Clone + 'static,
{
    let contexts = WorkerContext::local_grid(grid, &Device::Cpu).expect("grid construction");
    let handles: Vec<_> = contexts
        .into_iter()
        .map(|ctx| {
            let f = f.clone();
            thread::spawn(move || f(ctx))
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("worker thread panicked"))
        .collect()
}

#[test]
fn test_row_then_column_reduce_matches_global() {
    let grid = GridShape::new(4, 2, 4).unwrap();

    let results = run_grid(grid, |ctx| {
        let contribution = (ctx.rank() + 1) as f32;
        let t = Tensor::new(&[contribution], ctx.device()).unwrap();

        // Row stage then column stage, the composition the gradient sync
        // relies on.
        let row = ctx.mp_group().all_reduce(&t).unwrap();
        let staged = ctx.dp_group().all_reduce(&row).unwrap();
        let staged = staged.to_vec1::<f32>().unwrap()[0];

        let global = ctx.global_group().all_reduce(&t).unwrap();
        let global = global.to_vec1::<f32>().unwrap()[0];
        (staged, global)
    });

    for (staged, global) in results {
        assert_eq!(staged, 10.0);
        assert_eq!(global, 10.0);
    }
}

#[test]
fn test_gather_order_follows_group_rank() {
    let grid = GridShape::new(4, 2, 4).unwrap();

    let results = run_grid(grid, |ctx| {
        let t = Tensor::new(&[ctx.rank() as f32], ctx.device()).unwrap();
        let mp = ctx.mp_group().all_gather(&t).unwrap().to_vec1::<f32>().unwrap();
        let dp = ctx.dp_group().all_gather(&t).unwrap().to_vec1::<f32>().unwrap();
        (ctx.rank(), mp, dp)
    });

    for (rank, mp, dp) in results {
        let grid = GridShape::new(4, 2, 4).unwrap();
        let expect_mp: Vec<f32> = grid.mp_group_ranks(rank).iter().map(|&r| r as f32).collect();
        let expect_dp: Vec<f32> = grid.dp_group_ranks(rank).iter().map(|&r| r as f32).collect();
        assert_eq!(mp, expect_mp);
        assert_eq!(dp, expect_dp);
    }
}

#[test]
fn test_broadcast_reaches_every_row_member() {
    let grid = GridShape::new(4, 2, 4).unwrap();

    let results = run_grid(grid, |ctx| {
        // Group rank 0 of each row holds the payload.
        let payload = if ctx.mp_group().rank() == 0 {
            (ctx.rank() as f32) + 100.0
        } else {
            0.0
        };
        let t = Tensor::new(&[payload], ctx.device()).unwrap();
        let out = ctx.mp_group().broadcast(&t, 0).unwrap();
        (ctx.rank(), out.to_vec1::<f32>().unwrap()[0])
    });

    // Row 0 is {0,1} rooted at rank 0, row 1 is {2,3} rooted at rank 2.
    for (rank, value) in results {
        let expected = if rank < 2 { 100.0 } else { 102.0 };
        assert_eq!(value, expected);
    }
}

#[test]
fn test_point_to_point_between_two_ranks() {
    let grid = GridShape::new(4, 2, 4).unwrap();

    let results = run_grid(grid, |ctx| match ctx.rank() {
        0 => {
            let t = Tensor::new(&[41.0f32, 42.0], ctx.device()).unwrap();
            ctx.global_group().send(&t, 3).unwrap();
            None
        }
        3 => {
            let t = ctx.global_group().recv(0).unwrap();
            Some(t.to_vec1::<f32>().unwrap())
        }
        _ => None,
    });

    assert_eq!(results[3], Some(vec![41.0, 42.0]));
    assert_eq!(results[0], None);
}

#[test]
fn test_single_worker_groups_are_degenerate() {
    let results = run_grid(GridShape::single_worker(), |ctx| {
        let t = Tensor::new(&[5.0f32], ctx.device()).unwrap();
        let reduced = ctx.global_group().all_reduce(&t).unwrap();
        (
            ctx.mp_group().size(),
            ctx.dp_group().size(),
            reduced.to_vec1::<f32>().unwrap()[0],
        )
    });

    assert_eq!(results[0], (1, 1, 5.0));
}
