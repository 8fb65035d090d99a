use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bytemuck::pod_collect_to_vec;
use half::{bf16, f16};
use safetensors::{tensor::Dtype, SafeTensors};
use tch::{nn, nn::ModuleT, Kind, Tensor};
use tracing::{debug, warn};

pub const EMBEDDING_DIM: i64 = 512;

fn bn_config() -> nn::BatchNormConfig {
    nn::BatchNormConfig { eps: 1e-3, momentum: 0.1, ..Default::default() }
}

fn max_pool(xs: &Tensor) -> Tensor {
    xs.max_pool2d(&[3, 3], &[2, 2], &[0, 0], &[1, 1], false)
}

// =============== BUILDING BLOCKS ===============
#[derive(Debug, Clone, Copy)]
struct ConvSpec {
    c_in: i64,
    c_out: i64,
    ksize: [i64; 2],
    stride: i64,
    padding: [i64; 2],
}

const fn sq(c_in: i64, c_out: i64, k: i64, stride: i64, pad: i64) -> ConvSpec {
    ConvSpec { c_in, c_out, ksize: [k, k], stride, padding: [pad, pad] }
}

const fn rect(c_in: i64, c_out: i64, ksize: [i64; 2], padding: [i64; 2]) -> ConvSpec {
    ConvSpec { c_in, c_out, ksize, stride: 1, padding }
}

/// conv (no bias) → batch norm → relu
#[derive(Debug)]
struct BasicConv2d {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl BasicConv2d {
    fn new(vs: &nn::Path, spec: ConvSpec) -> Self {
        let cfg = nn::ConvConfigND {
            stride: [spec.stride, spec.stride],
            padding: spec.padding,
            bias: false,
            ..Default::default()
        };
        let conv = nn::conv(&vs.sub("conv"), spec.c_in, spec.c_out, spec.ksize, cfg);
        let bn = nn::batch_norm2d(&vs.sub("bn"), spec.c_out, bn_config());
        Self { conv, bn }
    }
}

impl ModuleT for BasicConv2d {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.conv).apply_t(&self.bn, train).relu()
    }
}

// a lone conv sits directly under the branch name, a chain gets numbered children
fn branch(vs: &nn::Path, specs: &[ConvSpec]) -> Vec<BasicConv2d> {
    if let [spec] = specs {
        return vec![BasicConv2d::new(vs, *spec)];
    }
    specs
        .iter()
        .enumerate()
        .map(|(i, &spec)| BasicConv2d::new(&vs.sub(i), spec))
        .collect()
}

fn run_branch(xs: &Tensor, layers: &[BasicConv2d], train: bool) -> Tensor {
    layers
        .iter()
        .fold(xs.shallow_clone(), |x, layer| layer.forward_t(&x, train))
}

/// Block35 / Block17 / Block8: parallel branches, a 1x1 projection back to
/// the input width, then a scaled residual add.
#[derive(Debug)]
struct ResidualBlock {
    branches: Vec<Vec<BasicConv2d>>,
    conv2d: nn::Conv2D,
    scale: f64,
    relu: bool,
}

impl ResidualBlock {
    fn new(vs: &nn::Path, branch_specs: &[&[ConvSpec]], width: i64, scale: f64, relu: bool) -> Self {
        let branches: Vec<_> = branch_specs
            .iter()
            .enumerate()
            .map(|(i, specs)| branch(&vs.sub(format!("branch{i}")), specs))
            .collect();
        let concat: i64 = branch_specs
            .iter()
            .map(|specs| specs.last().map(|s| s.c_out).unwrap_or(0))
            .sum();
        let conv2d = nn::conv2d(&vs.sub("conv2d"), concat, width, 1, Default::default());
        Self { branches, conv2d, scale, relu }
    }

    fn block35(vs: &nn::Path, scale: f64) -> Self {
        Self::new(
            vs,
            &[
                &[sq(256, 32, 1, 1, 0)],
                &[sq(256, 32, 1, 1, 0), sq(32, 32, 3, 1, 1)],
                &[sq(256, 32, 1, 1, 0), sq(32, 32, 3, 1, 1), sq(32, 32, 3, 1, 1)],
            ],
            256,
            scale,
            true,
        )
    }

    fn block17(vs: &nn::Path, scale: f64) -> Self {
        Self::new(
            vs,
            &[
                &[sq(896, 128, 1, 1, 0)],
                &[
                    sq(896, 128, 1, 1, 0),
                    rect(128, 128, [1, 7], [0, 3]),
                    rect(128, 128, [7, 1], [3, 0]),
                ],
            ],
            896,
            scale,
            true,
        )
    }

    fn block8(vs: &nn::Path, scale: f64, relu: bool) -> Self {
        Self::new(
            vs,
            &[
                &[sq(1792, 192, 1, 1, 0)],
                &[
                    sq(1792, 192, 1, 1, 0),
                    rect(192, 192, [1, 3], [0, 1]),
                    rect(192, 192, [3, 1], [1, 0]),
                ],
            ],
            1792,
            scale,
            relu,
        )
    }
}

impl ModuleT for ResidualBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let outs: Vec<Tensor> = self.branches.iter().map(|b| run_branch(xs, b, train)).collect();
        let out = Tensor::cat(&outs, 1).apply(&self.conv2d) * self.scale + xs;
        if self.relu {
            out.relu()
        } else {
            out
        }
    }
}

/// Mixed_6a / Mixed_7a: strided conv branches concatenated with a max pool.
#[derive(Debug)]
struct Reduction {
    branches: Vec<Vec<BasicConv2d>>,
}

impl Reduction {
    fn new(vs: &nn::Path, branch_specs: &[&[ConvSpec]]) -> Self {
        let branches = branch_specs
            .iter()
            .enumerate()
            .map(|(i, specs)| branch(&vs.sub(format!("branch{i}")), specs))
            .collect();
        Self { branches }
    }

    fn mixed_6a(vs: &nn::Path) -> Self {
        Self::new(
            vs,
            &[
                &[sq(256, 384, 3, 2, 0)],
                &[sq(256, 192, 1, 1, 0), sq(192, 192, 3, 1, 1), sq(192, 256, 3, 2, 0)],
            ],
        )
    }

    fn mixed_7a(vs: &nn::Path) -> Self {
        Self::new(
            vs,
            &[
                &[sq(896, 256, 1, 1, 0), sq(256, 384, 3, 2, 0)],
                &[sq(896, 256, 1, 1, 0), sq(256, 256, 3, 2, 0)],
                &[sq(896, 256, 1, 1, 0), sq(256, 256, 3, 1, 1), sq(256, 256, 3, 2, 0)],
            ],
        )
    }
}

impl ModuleT for Reduction {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut outs: Vec<Tensor> = self.branches.iter().map(|b| run_branch(xs, b, train)).collect();
        outs.push(max_pool(xs));
        Tensor::cat(&outs, 1)
    }
}

// =============== MODEL ===============
/// InceptionResnetV1 with a classification head. Variable names follow the
/// facenet state dict, so VGGFace2 weights load without remapping.
#[derive(Debug)]
pub struct InceptionResnetV1 {
    stem: Vec<BasicConv2d>,
    head_stem: Vec<BasicConv2d>,
    repeat_1: Vec<ResidualBlock>,
    mixed_6a: Reduction,
    repeat_2: Vec<ResidualBlock>,
    mixed_7a: Reduction,
    repeat_3: Vec<ResidualBlock>,
    block8: ResidualBlock,
    dropout: f64,
    last_linear: nn::Linear,
    last_bn: nn::BatchNorm,
    logits: nn::Linear,
}

impl InceptionResnetV1 {
    pub fn new(vs: &nn::Path, num_classes: i64, dropout: f64) -> Self {
        let stem = vec![
            BasicConv2d::new(&vs.sub("conv2d_1a"), sq(3, 32, 3, 2, 0)),
            BasicConv2d::new(&vs.sub("conv2d_2a"), sq(32, 32, 3, 1, 0)),
            BasicConv2d::new(&vs.sub("conv2d_2b"), sq(32, 64, 3, 1, 1)),
        ];
        // after maxpool_3a
        let head_stem = vec![
            BasicConv2d::new(&vs.sub("conv2d_3b"), sq(64, 80, 1, 1, 0)),
            BasicConv2d::new(&vs.sub("conv2d_4a"), sq(80, 192, 3, 1, 0)),
            BasicConv2d::new(&vs.sub("conv2d_4b"), sq(192, 256, 3, 2, 0)),
        ];

        let r1 = vs.sub("repeat_1");
        let repeat_1 = (0..5).map(|i| ResidualBlock::block35(&r1.sub(i), 0.17)).collect();
        let mixed_6a = Reduction::mixed_6a(&vs.sub("mixed_6a"));
        let r2 = vs.sub("repeat_2");
        let repeat_2 = (0..10).map(|i| ResidualBlock::block17(&r2.sub(i), 0.10)).collect();
        let mixed_7a = Reduction::mixed_7a(&vs.sub("mixed_7a"));
        let r3 = vs.sub("repeat_3");
        let repeat_3 = (0..5).map(|i| ResidualBlock::block8(&r3.sub(i), 0.20, true)).collect();
        let block8 = ResidualBlock::block8(&vs.sub("block8"), 1.0, false);

        let last_linear = nn::linear(
            &vs.sub("last_linear"),
            1792,
            EMBEDDING_DIM,
            nn::LinearConfig { bias: false, ..Default::default() },
        );
        let last_bn = nn::batch_norm1d(&vs.sub("last_bn"), EMBEDDING_DIM, bn_config());
        let logits = nn::linear(&vs.sub("logits"), EMBEDDING_DIM, num_classes, Default::default());

        Self {
            stem,
            head_stem,
            repeat_1,
            mixed_6a,
            repeat_2,
            mixed_7a,
            repeat_3,
            block8,
            dropout,
            last_linear,
            last_bn,
            logits,
        }
    }

    fn features_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let x = run_branch(xs, &self.stem, train);
        let x = run_branch(&max_pool(&x), &self.head_stem, train);
        let x = self.repeat_1.iter().fold(x, |x, b| b.forward_t(&x, train));
        let x = self.mixed_6a.forward_t(&x, train);
        let x = self.repeat_2.iter().fold(x, |x, b| b.forward_t(&x, train));
        let x = self.mixed_7a.forward_t(&x, train);
        let x = self.repeat_3.iter().fold(x, |x, b| b.forward_t(&x, train));
        let x = self.block8.forward_t(&x, train);
        x.adaptive_avg_pool2d(&[1, 1])
            .dropout(self.dropout, train)
            .flatten(1, -1)
            .apply(&self.last_linear)
            .apply_t(&self.last_bn, train)
    }

    /// L2-normalized 512-d face embeddings, bypassing the classifier.
    pub fn embed_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let f = self.features_t(xs, train);
        let norm = f.norm_scalaropt_dim(2.0, &[1], true).clamp_min(1e-12);
        f / norm
    }
}

impl ModuleT for InceptionResnetV1 {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.features_t(xs, train).apply(&self.logits)
    }
}

// =============== PRETRAINED WEIGHTS ===============
fn load_safetensors_to_map(path: &Path) -> Result<HashMap<String, Tensor>> {
    let bytes = fs::read(path).with_context(|| format!("read file {}", path.display()))?;
    let st = SafeTensors::deserialize(&bytes).context("deserialize safetensors")?;
    let mut map = HashMap::new();

    for name in st.names() {
        let tv = st.tensor(name).with_context(|| format!("get tensor {name}"))?;
        let shape: Vec<i64> = tv.shape().iter().map(|&d| d as i64).collect();
        let data = tv.data();

        let t = match tv.dtype() {
            Dtype::F32 => Tensor::from_slice(&pod_collect_to_vec::<u8, f32>(data)),
            Dtype::F64 => Tensor::from_slice(&pod_collect_to_vec::<u8, f64>(data)).to_kind(Kind::Float),
            Dtype::F16 => {
                let bits = pod_collect_to_vec::<u8, u16>(data);
                let v: Vec<f32> = bits.iter().map(|&h| f16::from_bits(h).to_f32()).collect();
                Tensor::from_slice(&v)
            }
            Dtype::BF16 => {
                let bits = pod_collect_to_vec::<u8, u16>(data);
                let v: Vec<f32> = bits.iter().map(|&h| bf16::from_bits(h).to_f32()).collect();
                Tensor::from_slice(&v)
            }
            Dtype::I64 => Tensor::from_slice(&pod_collect_to_vec::<u8, i64>(data)),
            other => {
                warn!("skipping tensor {} with unsupported dtype {:?}", name, other);
                continue;
            }
        };
        map.insert(name.to_string(), t.reshape(&shape));
    }
    Ok(map)
}

#[derive(Debug, Clone, Default)]
pub struct PretrainedReport {
    pub copied: usize,
    /// Source tensors with no variable of the same name and shape.
    pub skipped: Vec<String>,
}

/// Copies every tensor of a safetensors file into the variable of the same
/// name and shape. A `logits` head trained on a different class count is
/// left at its fresh initialization.
pub fn load_pretrained(vs: &nn::VarStore, path: impl AsRef<Path>) -> Result<PretrainedReport> {
    let path = path.as_ref();
    let src = load_safetensors_to_map(path)?;
    let mut targets = vs.variables();

    let mut names: Vec<&String> = src.keys().collect();
    names.sort();

    let mut report = PretrainedReport::default();
    for name in names {
        if name.ends_with("num_batches_tracked") {
            continue;
        }
        let t = &src[name];
        match targets.get_mut(name.as_str()) {
            Some(dst) if dst.size() == t.size() => {
                let value = t.to_kind(dst.kind()).to_device(dst.device());
                tch::no_grad(|| {
                    dst.copy_(&value);
                });
                report.copied += 1;
            }
            _ => {
                debug!("not copying {} {:?}", name, t.size());
                report.skipped.push(name.clone());
            }
        }
    }

    if report.copied == 0 {
        bail!("no tensors copied from '{}'", path.display());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::TensorView;
    use tch::Device;
    use tempfile::TempDir;

    #[test]
    fn variable_names_follow_facenet_layout() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = InceptionResnetV1::new(&vs.root(), 3, 0.6);
        let vars = vs.variables();
        for name in [
            "conv2d_1a.conv.weight",
            "conv2d_1a.bn.running_var",
            "repeat_1.0.branch0.conv.weight",
            "repeat_1.4.branch2.2.bn.weight",
            "repeat_2.9.branch1.1.conv.weight",
            "mixed_6a.branch1.2.conv.weight",
            "mixed_7a.branch2.2.bn.bias",
            "block8.conv2d.bias",
            "last_linear.weight",
            "last_bn.running_mean",
            "logits.weight",
        ] {
            assert!(vars.contains_key(name), "missing {name}");
        }
        assert!(!vars.contains_key("last_linear.bias"));
        assert_eq!(vars["repeat_2.0.branch1.1.conv.weight"].size(), vec![128, 128, 1, 7]);
        assert_eq!(vars["logits.weight"].size(), vec![3, EMBEDDING_DIM]);
    }

    #[test]
    fn classifies_and_embeds_face_crops() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = InceptionResnetV1::new(&vs.root(), 5, 0.6);
        let xs = Tensor::randn(&[2, 3, 160, 160], (Kind::Float, Device::Cpu));

        let logits = tch::no_grad(|| net.forward_t(&xs, false));
        assert_eq!(logits.size(), vec![2, 5]);

        let emb = tch::no_grad(|| net.embed_t(&xs, false));
        assert_eq!(emb.size(), vec![2, EMBEDDING_DIM]);
        let norms = Vec::<f32>::try_from(&emb.norm_scalaropt_dim(2.0, &[1], false)).unwrap();
        for n in norms {
            assert!((n - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn pretrained_copies_matching_and_skips_foreign_head() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vggface2.safetensors");

        let stem: Vec<f32> = vec![0.5; 32 * 3 * 3 * 3];
        let head: Vec<f32> = vec![1.0; 10 * 512];
        let tracked: Vec<i64> = vec![3];
        let views = vec![
            (
                "conv2d_1a.conv.weight",
                TensorView::new(Dtype::F32, vec![32, 3, 3, 3], bytemuck::cast_slice(&stem)).unwrap(),
            ),
            (
                "logits.weight",
                TensorView::new(Dtype::F32, vec![10, 512], bytemuck::cast_slice(&head)).unwrap(),
            ),
            (
                "conv2d_1a.bn.num_batches_tracked",
                TensorView::new(Dtype::I64, vec![], bytemuck::cast_slice(&tracked)).unwrap(),
            ),
        ];
        safetensors::serialize_to_file(views, &None, &path).unwrap();

        let vs = nn::VarStore::new(Device::Cpu);
        let _net = InceptionResnetV1::new(&vs.root(), 3, 0.6);
        let report = load_pretrained(&vs, &path).unwrap();
        assert_eq!(report.copied, 1);
        assert_eq!(report.skipped, vec!["logits.weight".to_string()]);

        let w = &vs.variables()["conv2d_1a.conv.weight"];
        assert_eq!(f64::try_from(&w.mean(Kind::Float)).unwrap(), 0.5);
    }

    #[test]
    fn pretrained_without_matches_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.safetensors");
        let data: Vec<f32> = vec![0.0; 4];
        let views = vec![(
            "fc.weight",
            TensorView::new(Dtype::F32, vec![2, 2], bytemuck::cast_slice(&data)).unwrap(),
        )];
        safetensors::serialize_to_file(views, &None, &path).unwrap();

        let vs = nn::VarStore::new(Device::Cpu);
        let _net = InceptionResnetV1::new(&vs.root(), 3, 0.6);
        assert!(load_pretrained(&vs, &path).is_err());
    }
}
