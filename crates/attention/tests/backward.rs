mod common;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use flash_attention::reference;
use flash_attention::testing::{max_diff, report, within_bound};
use flash_attention::{
    flash_attention, flash_attention_backward, Config, DqBoundary, ExecutionContext, FlashAttention,
    Gradients, TileConfig,
};

use common::{max_abs, qkv, random, rng, to_f32_vec};

fn fused_grads(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    d_o: &Tensor,
    causal: bool,
    tiles: TileConfig,
    dq_boundary: DqBoundary,
) -> Result<Gradients> {
    let ctx = ExecutionContext::host();
    let attention = FlashAttention::new();
    let config = Config {
        causal,
        dq_boundary,
        ..Config::default()
    }
    .with_tiles(tiles);
    let fwd = attention.forward(&ctx, q, k, v, &config)?;
    Ok(attention.backward(&ctx, &fwd.saved, d_o, &config)?)
}

fn row(t: &[f32], r: usize) -> &[f32] {
    &t[r * 16..(r + 1) * 16]
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn relative(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(max_diff(a, b)? / max_abs(b)?.max(1e-6))
}

#[test]
fn half_precision_gradients_match_autograd() -> Result<()> {
    for causal in [false, true] {
        let (q, k, v) = qkv(71, (1, 2, 48, 56, 32), DType::F16)?;
        let d_o = random(&mut rng(72), &[1, 2, 48, 32], DType::F16)?;
        let fwd = flash_attention(&q, &k, &v, causal, None)?;
        let grads = flash_attention_backward(&fwd.saved, &d_o)?;
        let (dq, dk, dv) = reference::attention_backward(&q, &k, &v, &d_o, causal, None, true)?;

        for (name, fused, expected) in [("dq", &grads.dq, &dq), ("dk", &grads.dk, &dk), ("dv", &grads.dv, &dv)] {
            assert_eq!(fused.dtype(), DType::F16);
            assert_eq!(fused.dims(), expected.dims());
            let err = relative(fused, expected)?;
            assert!(err < 1e-2, "{name} causal={causal}: relative error {err}");
        }
    }
    Ok(())
}

#[test]
fn f32_gradients_match_autograd_on_ragged_tiles() -> Result<()> {
    let shapes = [(5, 8), (7, 7), (9, 4), (16, 16)];
    let tilings = [
        TileConfig::new(2, 3, 1, 1),
        TileConfig::new(4, 4, 1, 1),
        TileConfig::new(16, 2, 1, 1),
    ];
    for (seed, &(q_len, k_len)) in shapes.iter().enumerate() {
        let (q, k, v) = qkv(200 + seed as u64, (2, 2, q_len, k_len, 16), DType::F32)?;
        let d_o = random(&mut rng(300 + seed as u64), &[2, 2, q_len, 16], DType::F32)?;
        for causal in [false, true] {
            if causal && k_len < q_len {
                continue;
            }
            let (dq, dk, dv) = reference::attention_backward(&q, &k, &v, &d_o, causal, None, true)?;
            for tiles in tilings {
                let grads = fused_grads(&q, &k, &v, &d_o, causal, tiles, DqBoundary::Absolute)?;
                for (name, fused, expected) in [("dq", &grads.dq, &dq), ("dk", &grads.dk, &dk), ("dv", &grads.dv, &dv)] {
                    let diff = max_diff(fused, expected)?;
                    assert!(diff < 1e-4, "{name} M={q_len} N={k_len} causal={causal} {tiles:?}: {diff}");
                }
            }
        }
    }
    Ok(())
}

#[test]
fn layout_does_not_change_gradients() -> Result<()> {
    let (batch, seq, heads, dim) = (1, 13, 2, 32);
    let mut rng = rng(81);
    let mut bthd = || random(&mut rng, &[batch, seq, heads, dim], DType::BF16);
    let (q, k, v, d_o) = (bthd()?, bthd()?, bthd()?, bthd()?);
    let logical = |t: &Tensor| t.transpose(1, 2);

    let (q_t, k_t, v_t, do_t) = (logical(&q)?, logical(&k)?, logical(&v)?, logical(&d_o)?);
    let fwd = flash_attention(&q_t, &k_t, &v_t, true, None)?;
    let strided = flash_attention_backward(&fwd.saved, &do_t)?;

    let (q_c, k_c, v_c, do_c) = (q_t.contiguous()?, k_t.contiguous()?, v_t.contiguous()?, do_t.contiguous()?);
    let fwd = flash_attention(&q_c, &k_c, &v_c, true, None)?;
    let packed = flash_attention_backward(&fwd.saved, &do_c)?;

    assert_eq!(max_diff(&strided.dq, &packed.dq)?, 0.0);
    assert_eq!(max_diff(&strided.dk, &packed.dk)?, 0.0);
    assert_eq!(max_diff(&strided.dv, &packed.dv)?, 0.0);
    Ok(())
}

#[test]
fn gradients_do_not_leak_to_future_keys() -> Result<()> {
    // q_len = k_len = 6 with a single query row of gradient: only keys 0..=2
    // can receive dk/dv from row 2.
    let (q, k, v) = qkv(91, (1, 1, 6, 6, 16), DType::F32)?;
    let mut mask = vec![0f32; 6 * 16];
    mask[2 * 16..3 * 16].iter_mut().for_each(|x| *x = 1.0);
    let d_o = Tensor::from_vec(mask, (1, 1, 6, 16), &Device::Cpu)?;
    let grads = fused_grads(&q, &k, &v, &d_o, true, TileConfig::new(2, 2, 1, 1), DqBoundary::Absolute)?;
    let dk = to_f32_vec(&grads.dk)?;
    let dv = to_f32_vec(&grads.dv)?;
    assert!(dk[3 * 16..].iter().all(|&x| x == 0.0));
    assert!(dv[3 * 16..].iter().all(|&x| x == 0.0));
    assert!(dv[..3 * 16].iter().any(|&x| x != 0.0));
    Ok(())
}

#[test]
fn remainder_boundary_zeroes_trailing_query_rows() -> Result<()> {
    // M = 5, BLOCK_M = 2: the last query tile holds row 4 only. The remainder
    // mask keeps rows below 5 % 2 = 1, which no row of that tile satisfies.
    let (q, k, v) = qkv(111, (1, 2, 5, 8, 16), DType::F32)?;
    let d_o = random(&mut rng(112), &[1, 2, 5, 16], DType::F32)?;
    let tiles = TileConfig::new(2, 4, 1, 1);
    let absolute = fused_grads(&q, &k, &v, &d_o, true, tiles, DqBoundary::Absolute)?;
    let remainder = fused_grads(&q, &k, &v, &d_o, true, tiles, DqBoundary::Remainder)?;

    assert_eq!(max_diff(&absolute.dq.narrow(2, 0, 4)?, &remainder.dq.narrow(2, 0, 4)?)?, 0.0);
    assert!(to_f32_vec(&remainder.dq.narrow(2, 4, 1)?)?.iter().all(|&x| x == 0.0));
    assert!(to_f32_vec(&absolute.dq.narrow(2, 4, 1)?)?.iter().any(|&x| x != 0.0));

    // only the Q kernel is affected
    assert_eq!(max_diff(&absolute.dk, &remainder.dk)?, 0.0);
    assert_eq!(max_diff(&absolute.dv, &remainder.dv)?, 0.0);
    Ok(())
}

#[test]
fn remainder_boundary_drops_trailing_key_columns_from_dq() -> Result<()> {
    // N = 8, BLOCK_N = 3: the last key tile (6..8) is masked out of dq entirely.
    let (q, k, v) = qkv(121, (1, 1, 4, 8, 16), DType::F32)?;
    let d_o = random(&mut rng(122), &[1, 1, 4, 16], DType::F32)?;
    let tiles = TileConfig::new(4, 3, 1, 1);
    let remainder = fused_grads(&q, &k, &v, &d_o, false, tiles, DqBoundary::Remainder)?;
    let absolute = fused_grads(&q, &k, &v, &d_o, false, tiles, DqBoundary::Absolute)?;
    assert!(max_diff(&absolute.dq, &remainder.dq)? > 0.0);

    // dq_i = scale * sum_j ds_ij k_j restricted to j < 6 equals the absolute
    // result minus the contribution of keys 6 and 7
    let saved = flash_attention(&q, &k, &v, false, None)?;
    let (qv, kv, vv) = (to_f32_vec(&q)?, to_f32_vec(&k)?, to_f32_vec(&v)?);
    let (ov, dov) = (to_f32_vec(&saved.output)?, to_f32_vec(&d_o)?);
    let lse = to_f32_vec(&saved.log_normalizer)?;
    let scale = 0.25f32;
    let abs_dq = to_f32_vec(&absolute.dq)?;
    let rem_dq = to_f32_vec(&remainder.dq)?;
    for i in 0..4 {
        let delta = dot(row(&ov, i), row(&dov, i));
        let mut tail = vec![0f32; 16];
        for j in 6..8 {
            let p = (dot(row(&qv, i), row(&kv, j)) * scale - lse[i]).exp();
            let ds = p * (dot(row(&dov, i), row(&vv, j)) - delta);
            for (t, kj) in tail.iter_mut().zip(row(&kv, j)) {
                *t += ds * kj * scale;
            }
        }
        for d in 0..16 {
            let expected = abs_dq[i * 16 + d] - tail[d];
            assert!((rem_dq[i * 16 + d] - expected).abs() < 1e-4, "row {i} col {d}");
        }
    }
    Ok(())
}

#[test]
fn boundary_modes_agree_on_single_partial_tiles() -> Result<()> {
    let (q, k, v) = qkv(131, (1, 1, 5, 7, 16), DType::F16)?;
    let d_o = random(&mut rng(132), &[1, 1, 5, 16], DType::F16)?;
    let tiles = TileConfig::new(8, 8, 1, 1);
    let absolute = fused_grads(&q, &k, &v, &d_o, true, tiles, DqBoundary::Absolute)?;
    let remainder = fused_grads(&q, &k, &v, &d_o, true, tiles, DqBoundary::Remainder)?;
    assert_eq!(max_diff(&absolute.dq, &remainder.dq)?, 0.0);
    Ok(())
}

#[test]
fn empty_query_backward_has_zero_key_gradients() -> Result<()> {
    let q = Tensor::zeros((1, 1, 0, 16), DType::F32, &Device::Cpu)?;
    let k = Tensor::ones((1, 1, 4, 16), DType::F32, &Device::Cpu)?;
    let fwd = flash_attention(&q, &k, &k, false, None)?;
    let grads = flash_attention_backward(&fwd.saved, &q)?;
    assert_eq!(grads.dq.dims(), &[1, 1, 0, 16]);
    assert!(to_f32_vec(&grads.dk)?.iter().all(|&x| x == 0.0));
    assert!(to_f32_vec(&grads.dv)?.iter().all(|&x| x == 0.0));
    Ok(())
}

#[test]
fn gradients_stay_within_unfused_bound() -> Result<()> {
    for (seed, dtype) in [(141u64, DType::F16), (142, DType::BF16)] {
        for causal in [false, true] {
            // 20 prefix keys
            let (q, k, v) = qkv(seed, (1, 2, 70, 90, 64), dtype)?;
            let d_o = random(&mut rng(seed + 10), &[1, 2, 70, 64], dtype)?;
            let fwd = flash_attention(&q, &k, &v, causal, None)?;
            let grads = flash_attention_backward(&fwd.saved, &d_o)?;
            let (bq, bk, bv) = reference::attention_backward(&q, &k, &v, &d_o, causal, None, false)?;
            let (eq, ek, ev) = reference::attention_backward(&q, &k, &v, &d_o, causal, None, true)?;

            for (name, fused, baseline, exact) in [
                ("dq", &grads.dq, &bq, &eq),
                ("dk", &grads.dk, &bk, &ek),
                ("dv", &grads.dv, &bv, &ev),
            ] {
                let label = format!("{name} {dtype:?} causal={causal}");
                let (fused_error, baseline_error) = report(&label, fused, baseline, exact)?;
                assert!(
                    within_bound(fused_error, baseline_error, 1e-5),
                    "{label}: fused {fused_error} vs baseline {baseline_error}"
                );
            }
        }
    }
    Ok(())
}
