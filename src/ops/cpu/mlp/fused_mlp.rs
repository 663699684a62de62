//! CPU reference implementation of the fused feed-forward block
//!
//! Each projection reconstructs its weight into the dq slice, then rows are
//! projected in parallel with f32 accumulation. Intermediate activations
//! live in the planned scratch slices; inputs longer than `max_rows` are
//! processed in chunks.

use crate::error::{Error, Result};
use crate::inference::scratch::carve;
use crate::nn::linear::matvec;
use crate::nn::lora::AdapterId;
use crate::ops::traits::mlp::fused_mlp::{FusedMlpOps, MlpLoras, QMlpDesc, SublayerLoras};
use crate::quant::QuantMatrix;
use half::f16;
use numr::runtime::cpu::CpuClient;
use rayon::prelude::*;
use tracing::debug;

/// Largest finite f16
const F16_LIMIT: f32 = 65504.0;

/// Fused block state held by the caller
#[derive(Debug)]
pub struct CpuQMlp {
    desc: QMlpDesc,
    loras: MlpLoras,
    lora_rank: usize,
    hidden_size: usize,
    intermediate_size: usize,
}

impl CpuQMlp {
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }

    /// Blending elements per row required by the current adapters
    pub fn lora_rank(&self) -> usize {
        self.lora_rank
    }
}

fn kernel_err(reason: String) -> Error {
    Error::KernelError { reason }
}

fn check_matrix(name: &str, m: &QuantMatrix, in_features: usize, out_features: usize) -> Result<()> {
    if m.in_features() != in_features || m.out_features() != out_features {
        return Err(kernel_err(format!(
            "{name} is {}x{}, block expects {out_features}x{in_features}",
            m.out_features(),
            m.in_features()
        )));
    }
    Ok(())
}

fn check_loras(name: &str, loras: &SublayerLoras, in_features: usize, out_features: usize) -> Result<usize> {
    if loras.a.len() != loras.b.len() || loras.a.keys().any(|id| !loras.b.contains_key(id)) {
        return Err(kernel_err(format!("{name}: adapter A and B factor sets differ")));
    }
    let mut rank = 0;
    for (id, a) in &loras.a {
        let b = &loras.b[id];
        if a.rows() != in_features || b.cols() != out_features || a.cols() != b.rows() {
            return Err(kernel_err(format!(
                "{name}: {id} factors {}x{} / {}x{} do not fit {in_features}->{out_features}",
                a.rows(),
                a.cols(),
                b.rows(),
                b.cols()
            )));
        }
        rank = rank.max(a.cols());
    }
    Ok(rank)
}

/// One projection row: `y = W x + bias + sum_adapters (x A) B`
fn project_row(
    weight: &[f16],
    bias: Option<&[f16]>,
    x: &[f16],
    lora: Option<(&SublayerLoras, &[AdapterId], &mut [f16])>,
    y: &mut [f16],
) {
    let mut acc = vec![0.0f32; y.len()];
    matvec(weight, x, &mut acc);
    if let Some(bias) = bias {
        for (a, b) in acc.iter_mut().zip(bias) {
            *a += b.to_f32();
        }
    }
    if let Some((loras, adapters, temp)) = lora {
        for id in adapters {
            let (Some(a), Some(b)) = (loras.a.get(id), loras.b.get(id)) else {
                continue;
            };
            let rank = a.cols();
            for (c, t) in temp[..rank].iter_mut().enumerate() {
                let v: f32 = x
                    .iter()
                    .zip(a.data().chunks_exact(rank))
                    .map(|(xi, a_row)| xi.to_f32() * a_row[c].to_f32())
                    .sum();
                *t = f16::from_f32(v);
            }
            for (t, b_row) in temp[..rank].iter().zip(b.data().chunks_exact(b.cols())) {
                let t = t.to_f32();
                for (o, bv) in acc.iter_mut().zip(b_row) {
                    *o += t * bv.to_f32();
                }
            }
        }
    }
    for (o, a) in y.iter_mut().zip(&acc) {
        *o = f16::from_f32(*a);
    }
}

/// Project `input` rows through `matrix` into `output`, reconstructing the
/// weight into `dq` first.
#[allow(clippy::too_many_arguments)]
fn project(
    matrix: &QuantMatrix,
    loras: &SublayerLoras,
    input: &[f16],
    output: &mut [f16],
    dq: &mut [f16],
    adapters: &[AdapterId],
    lora_temp: Option<&mut [f16]>,
    rank: usize,
) -> Result<()> {
    let (in_f, out_f) = (matrix.in_features(), matrix.out_features());
    let weight = &mut dq[..matrix.numel()];
    matrix.dequantize_into(weight)?;
    let weight = &*weight;
    let bias = matrix.bias();

    match lora_temp {
        Some(temp) if rank > 0 && !adapters.is_empty() && !loras.is_empty() => output
            .par_chunks_mut(out_f)
            .zip(input.par_chunks(in_f))
            .zip(temp.par_chunks_mut(rank))
            .for_each(|((y, x), t)| project_row(weight, bias, x, Some((loras, adapters, t)), y)),
        _ => output
            .par_chunks_mut(out_f)
            .zip(input.par_chunks(in_f))
            .for_each(|(y, x)| project_row(weight, bias, x, None, y)),
    }
    Ok(())
}

impl FusedMlpOps for CpuClient {
    type Handle = CpuQMlp;

    fn make_q_mlp(&self, desc: QMlpDesc) -> Result<CpuQMlp> {
        let h = desc.norm.hidden_size();
        let i = desc.up.out_features();
        if let Some(gate) = &desc.gate {
            check_matrix("gate", gate, h, i)?;
        }
        check_matrix("up", &desc.up, h, i)?;
        check_matrix("down", &desc.down, i, h)?;
        if desc.max_rows == 0 {
            return Err(kernel_err("max_rows must be > 0".into()));
        }

        let slices = [&desc.temp_state, &desc.temp_a, &desc.temp_b, &desc.temp_dq];
        if slices.iter().any(|s| !s.same_region(&desc.temp_state)) {
            return Err(kernel_err("scratch slices come from different regions".into()));
        }
        let dq_needed = [desc.gate.as_deref(), Some(&*desc.up), Some(&*desc.down)]
            .into_iter()
            .flatten()
            .map(QuantMatrix::numel)
            .max()
            .unwrap_or(0);
        for (name, slice, needed) in [
            ("state", &desc.temp_state, desc.max_rows * h),
            ("a", &desc.temp_a, desc.max_rows * i),
            ("b", &desc.temp_b, desc.max_rows * i),
            ("dq", &desc.temp_dq, dq_needed),
        ] {
            if slice.elements() < needed {
                return Err(kernel_err(format!(
                    "temp_{name} holds {} elements, block needs {needed}",
                    slice.elements()
                )));
            }
        }

        debug!(
            hidden = h,
            intermediate = i,
            gated = desc.gate.is_some(),
            act = %desc.act,
            max_rows = desc.max_rows,
            "created fused MLP"
        );
        Ok(CpuQMlp {
            desc,
            loras: MlpLoras::default(),
            lora_rank: 0,
            hidden_size: h,
            intermediate_size: i,
        })
    }

    fn q_mlp_forward(
        &self,
        handle: &CpuQMlp,
        hidden: &mut [f16],
        adapters: &[AdapterId],
        mut lora_temp: Option<&mut [f16]>,
    ) -> Result<()> {
        let (h, i) = (handle.hidden_size, handle.intermediate_size);
        let desc = &handle.desc;
        if hidden.len() % h != 0 {
            return Err(kernel_err(format!(
                "hidden state of {} values is not a multiple of {h}",
                hidden.len()
            )));
        }
        let rows = hidden.len() / h;
        if rows == 0 {
            return Ok(());
        }
        let rank = handle.lora_rank;
        if !adapters.is_empty() && rank > 0 {
            let needed = rows.min(desc.max_rows) * rank;
            match lora_temp.as_deref() {
                Some(temp) if temp.len() >= needed => {}
                Some(temp) => {
                    return Err(kernel_err(format!(
                        "lora_temp holds {} elements, need {needed}",
                        temp.len()
                    )))
                }
                None => return Err(kernel_err("adapters given without lora_temp".into())),
            }
        }

        let mut region = desc.temp_state.lock_region()?;
        let [state, act_a, act_b, dq] = carve(
            &mut region,
            [
                desc.temp_state.element_range(),
                desc.temp_a.element_range(),
                desc.temp_b.element_range(),
                desc.temp_dq.element_range(),
            ],
        )
        .ok_or_else(|| kernel_err("scratch slices overlap or exceed their region".into()))?;

        for chunk in hidden.chunks_mut(desc.max_rows * h) {
            let n = chunk.len() / h;
            let state = &mut state[..n * h];
            let act_a = &mut act_a[..n * i];
            let act_b = &mut act_b[..n * i];

            for (src, dst) in chunk.chunks_exact(h).zip(state.chunks_exact_mut(h)) {
                desc.norm.normalize_row(src, dst);
            }

            match &desc.gate {
                Some(gate) => {
                    project(gate, &handle.loras.gate, state, act_a, dq, adapters, lora_temp.as_deref_mut(), rank)?;
                    project(&desc.up, &handle.loras.up, state, act_b, dq, adapters, lora_temp.as_deref_mut(), rank)?;
                    act_a.par_iter_mut().zip(act_b.par_iter()).for_each(|(a, b)| {
                        let y = desc.act.apply(a.to_f32()) * b.to_f32();
                        *a = f16::from_f32(y.clamp(-F16_LIMIT, F16_LIMIT));
                    });
                }
                None => {
                    project(&desc.up, &handle.loras.up, state, act_b, dq, adapters, lora_temp.as_deref_mut(), rank)?;
                    act_a.par_iter_mut().zip(act_b.par_iter()).for_each(|(a, b)| {
                        *a = f16::from_f32(desc.act.apply(b.to_f32()));
                    });
                }
            }

            project(&desc.down, &handle.loras.down, act_a, state, dq, adapters, lora_temp.as_deref_mut(), rank)?;

            for (x, s) in chunk.iter_mut().zip(state.iter()) {
                *x = f16::from_f32(x.to_f32() + s.to_f32());
            }
        }
        Ok(())
    }

    fn q_mlp_set_loras(&self, handle: &mut CpuQMlp, loras: MlpLoras) -> Result<usize> {
        let (h, i) = (handle.hidden_size, handle.intermediate_size);
        let rank = check_loras("gate", &loras.gate, h, i)?
            .max(check_loras("up", &loras.up, h, i)?)
            .max(check_loras("down", &loras.down, i, h)?);
        if handle.desc.gate.is_none() && !loras.gate.is_empty() {
            return Err(kernel_err("gate adapters on a block without a gate".into()));
        }
        handle.loras = loras;
        handle.lora_rank = rank;
        Ok(rank)
    }

    fn free_q_mlp(&self, handle: CpuQMlp) {
        debug!(hidden = handle.hidden_size, "freed fused MLP");
        drop(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DeviceId;
    use crate::inference::scratch::DeviceScratch;
    use crate::model::NormKind;
    use crate::nn::{Activation, MlpNorm};
    use crate::test_utils::cpu_setup;
    use std::sync::Arc;

    fn matrix(out: usize, inp: usize, seed: f32) -> Arc<QuantMatrix> {
        let w: Vec<f32> = (0..out * inp)
            .map(|k| ((k as f32 + seed) * 0.37).sin() * 0.1)
            .collect();
        Arc::new(QuantMatrix::quantize(&w, out, inp, 32).unwrap())
    }

    fn desc(scratch: &mut DeviceScratch, max_rows: usize) -> QMlpDesc {
        let (h, i) = (32, 64);
        let norm = MlpNorm::new(NormKind::RmsNorm, vec![f16::ONE; h], None, 1e-5).unwrap();
        scratch.begin_alloc();
        QMlpDesc {
            norm,
            gate: Some(matrix(i, h, 1.0)),
            up: matrix(i, h, 2.0),
            down: matrix(h, i, 3.0),
            temp_state: scratch.slice(max_rows * h * 2 + 128).unwrap(),
            temp_a: scratch.slice(max_rows * i * 2 + 128).unwrap(),
            temp_b: scratch.slice(max_rows * i * 2 + 128).unwrap(),
            temp_dq: scratch.slice(h * i * 2 + 128).unwrap(),
            max_rows,
            act: Activation::Silu,
        }
    }

    #[test]
    fn test_chunking_matches_single_pass() {
        let (client, _) = cpu_setup();
        let mut scratch = DeviceScratch::new(DeviceId(0), 1 << 16);
        let small = client.make_q_mlp(desc(&mut scratch, 2)).unwrap();
        let mut scratch2 = DeviceScratch::new(DeviceId(0), 1 << 16);
        let large = client.make_q_mlp(desc(&mut scratch2, 8)).unwrap();

        let input: Vec<f16> = (0..5 * 32).map(|k| f16::from_f32((k as f32 * 0.11).cos())).collect();
        let mut a = input.clone();
        let mut b = input.clone();
        client.q_mlp_forward(&small, &mut a, &[], None).unwrap();
        client.q_mlp_forward(&large, &mut b, &[], None).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, input);
    }

    #[test]
    fn test_undersized_scratch_rejected() {
        let (client, _) = cpu_setup();
        let mut scratch = DeviceScratch::new(DeviceId(0), 1 << 16);
        let mut d = desc(&mut scratch, 4);
        d.max_rows = 64;
        assert!(matches!(client.make_q_mlp(d), Err(Error::KernelError { .. })));
    }

    #[test]
    fn test_adapters_require_temp() {
        let (client, _) = cpu_setup();
        let mut scratch = DeviceScratch::new(DeviceId(0), 1 << 16);
        let mut handle = client.make_q_mlp(desc(&mut scratch, 4)).unwrap();
        let id = crate::nn::lora::AdapterRegistry::new().register("a");
        let lora = crate::nn::lora::LoraWeights::new(&[0.1; 32 * 2], &[0.1; 2 * 64], 32, 64, 2, 1.0).unwrap();
        let mut loras = MlpLoras::default();
        loras.up.a.insert(id, lora.a.clone());
        loras.up.b.insert(id, lora.b.clone());
        assert_eq!(client.q_mlp_set_loras(&mut handle, loras).unwrap(), 2);

        let mut hidden = vec![f16::ONE; 32];
        assert!(client.q_mlp_forward(&handle, &mut hidden, &[id], None).is_err());
        let mut temp = vec![f16::ZERO; 4 * 2];
        client
            .q_mlp_forward(&handle, &mut hidden, &[id], Some(&mut temp))
            .unwrap();
        client.free_q_mlp(handle);
    }
}
