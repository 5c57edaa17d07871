use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use fluxdeclip_core::{
    load_fluxdeclip, txt_ids, Control, DoubleBlockArgs, DoubleBlockOutput, DoubleBlockPatch,
    Error, FluxDeclip, FluxParams, LoadConfig, ModelDType, ModulationConsumer, ModulationSlot,
    PatchedLatent, Result, SingleBlockArgs, SingleBlockPatch, TransformerOptions,
};

const TXT_LEN: usize = 5;

fn tiny_params() -> FluxParams {
    FluxParams {
        in_channels: 4,
        vec_in_dim: 8,
        context_in_dim: 8,
        hidden_size: 16,
        mlp_ratio: 2.,
        num_heads: 2,
        depth: 2,
        depth_single_blocks: 3,
        axes_dim: vec![2, 2, 4],
        theta: 10_000,
        qkv_bias: true,
        guidance_embed: false,
        approximator_in_dim: 64,
        approximator_hidden_dim: 32,
        approximator_layers: 2,
        mod_index_length: 3 * 3 + 2 * 2 * 6 + 2,
    }
}

/// Random weights for every tensor the model asks for.
fn random_weights(params: &FluxParams) -> Result<HashMap<String, Tensor>> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    FluxDeclip::new(params, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
    let data = varmap.data().lock().unwrap();
    let mut weights = HashMap::new();
    for (name, var) in data.iter() {
        weights.insert(name.clone(), Tensor::randn(0f32, 0.2, var.shape(), &dev)?);
    }
    Ok(weights)
}

fn tiny_model() -> Result<(FluxDeclip, HashMap<String, Tensor>)> {
    let params = tiny_params();
    let weights = random_weights(&params)?;
    let vb = VarBuilder::from_tensors(weights.clone(), DType::F32, &Device::Cpu);
    Ok((FluxDeclip::new(&params, vb)?, weights))
}

struct Inputs {
    latent: Tensor,
    patched: PatchedLatent,
    context: Tensor,
    txt_ids: Tensor,
    timestep: Tensor,
    guidance: Tensor,
}

fn inputs(height: usize, width: usize) -> Result<Inputs> {
    let dev = Device::Cpu;
    let latent = Tensor::randn(0f32, 1., (2, 4, height, width), &dev)?;
    let patched = PatchedLatent::new(&latent, 2)?;
    Ok(Inputs {
        patched,
        latent,
        context: Tensor::randn(0f32, 1., (2, TXT_LEN, 8), &dev)?,
        txt_ids: txt_ids(2, TXT_LEN, DType::F32, &dev)?,
        timestep: Tensor::new(&[0.3f32, 0.8], &dev)?,
        guidance: Tensor::new(4f32, &dev)?,
    })
}

fn run(
    model: &FluxDeclip,
    inputs: &Inputs,
    control: Option<&Control>,
    options: &TransformerOptions,
) -> Result<Tensor> {
    model.forward_orig(
        &inputs.patched.img,
        &inputs.patched.img_ids,
        &inputs.context,
        &inputs.txt_ids,
        &inputs.timestep,
        Some(&inputs.guidance),
        control,
        options,
    )
}

fn flat(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

/// Records the stream entering a block and then runs the block unchanged.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Option<Tensor>>,
}

impl Recorder {
    fn seen(&self) -> Tensor {
        self.seen.lock().unwrap().clone().expect("block never ran")
    }
}

impl DoubleBlockPatch for Recorder {
    fn forward(
        &self,
        args: DoubleBlockArgs<'_>,
        original: &dyn Fn(DoubleBlockArgs<'_>) -> Result<DoubleBlockOutput>,
    ) -> Result<DoubleBlockOutput> {
        *self.seen.lock().unwrap() = Some(args.img.clone());
        original(args)
    }
}

impl SingleBlockPatch for Recorder {
    fn forward(
        &self,
        args: SingleBlockArgs<'_>,
        original: &dyn Fn(SingleBlockArgs<'_>) -> Result<Tensor>,
    ) -> Result<Tensor> {
        *self.seen.lock().unwrap() = Some(args.img.clone());
        original(args)
    }
}

/// Ignores the block and returns zeros.
struct Zeroing;

impl SingleBlockPatch for Zeroing {
    fn forward(
        &self,
        args: SingleBlockArgs<'_>,
        _original: &dyn Fn(SingleBlockArgs<'_>) -> Result<Tensor>,
    ) -> Result<Tensor> {
        Ok(args.img.zeros_like()?)
    }
}

/// Skips the block, returning both streams untouched.
struct Passthrough;

impl DoubleBlockPatch for Passthrough {
    fn forward(
        &self,
        args: DoubleBlockArgs<'_>,
        _original: &dyn Fn(DoubleBlockArgs<'_>) -> Result<DoubleBlockOutput>,
    ) -> Result<DoubleBlockOutput> {
        Ok(DoubleBlockOutput {
            img: args.img.clone(),
            txt: args.txt.clone(),
        })
    }
}

#[test]
fn invalid_params_fail_at_construction() {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let params = FluxParams {
        hidden_size: 15,
        ..tiny_params()
    };
    assert!(matches!(
        FluxDeclip::new(&params, vb.clone()),
        Err(Error::Configuration(_))
    ));
    let params = FluxParams {
        axes_dim: vec![2, 2, 2],
        ..tiny_params()
    };
    assert!(matches!(
        FluxDeclip::new(&params, vb.clone()),
        Err(Error::Configuration(_))
    ));
    let params = FluxParams {
        mod_index_length: 344,
        ..tiny_params()
    };
    assert!(matches!(
        FluxDeclip::new(&params, vb),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn non_rank3_streams_fail_before_compute() -> Result<()> {
    let (model, _) = tiny_model()?;
    let inputs = inputs(4, 6)?;
    let img = inputs.patched.img.flatten_to(1)?;
    let err = model
        .forward_orig(
            &img,
            &inputs.patched.img_ids,
            &inputs.context,
            &inputs.txt_ids,
            &inputs.timestep,
            None,
            None,
            &TransformerOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Shape { name: "img", .. }));

    let txt = inputs.context.get(0)?;
    let err = model
        .forward_orig(
            &inputs.patched.img,
            &inputs.patched.img_ids,
            &txt,
            &inputs.txt_ids,
            &inputs.timestep,
            None,
            None,
            &TransformerOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Shape { name: "txt", .. }));
    Ok(())
}

#[test]
fn forward_is_deterministic() -> Result<()> {
    let (model, _) = tiny_model()?;
    let inputs = inputs(4, 6)?;
    let options = TransformerOptions::default();
    let a = run(&model, &inputs, None, &options)?;
    let b = run(&model, &inputs, None, &options)?;
    assert_eq!(a.dims(), &[2, 6, 16]);
    assert_eq!(flat(&a), flat(&b));
    Ok(())
}

#[test]
fn modulation_table_covers_every_block() -> Result<()> {
    let (model, _) = tiny_model()?;
    let table = model.modulation(&Tensor::new(0.5f32, &Device::Cpu)?, None, 3, DType::F32)?;
    assert!(!table.is_empty());
    assert_eq!(table.len(), 3 + 2 + 2 + 1);
    assert!(matches!(
        table.get(ModulationConsumer::FinalLayer),
        Some(ModulationSlot::Final(_))
    ));
    assert!(matches!(
        table.get(ModulationConsumer::DoubleBlockImg(1)),
        Some(ModulationSlot::Double(_))
    ));
    assert!(table.get(ModulationConsumer::SingleBlock(3)).is_none());
    assert_eq!(table.single(2)?.gate.dims(), &[3, 1, 16]);
    assert_eq!(table.double(1)?.txt[1].shift.dims(), &[3, 1, 16]);
    assert!(table.single(3).is_err());
    Ok(())
}

#[test]
fn input_control_adds_to_image_stream() -> Result<()> {
    let (model, _) = tiny_model()?;
    let inputs = inputs(4, 6)?;
    let recorder = Arc::new(Recorder::default());
    let options = TransformerOptions::new().with_double_block_patch(1, recorder.clone());

    run(&model, &inputs, None, &options)?;
    let plain = recorder.seen();

    let ctrl = Tensor::randn(0f32, 1., plain.shape(), &Device::Cpu)?;
    let control = Control {
        input: vec![Some(ctrl.clone())],
        output: vec![],
    };
    run(&model, &inputs, Some(&control), &options)?;
    let controlled = recorder.seen();

    assert_eq!(flat(&controlled), flat(&(plain + ctrl)?));
    Ok(())
}

#[test]
fn output_control_only_touches_image_tokens() -> Result<()> {
    let (model, _) = tiny_model()?;
    let inputs = inputs(4, 6)?;
    let recorder = Arc::new(Recorder::default());
    let options = TransformerOptions::new().with_single_block_patch(1, recorder.clone());

    run(&model, &inputs, None, &options)?;
    let plain = recorder.seen();

    let n_img = inputs.patched.num_tokens();
    let ctrl = Tensor::randn(0f32, 1., (2, n_img, 16), &Device::Cpu)?;
    let control = Control {
        input: vec![None, None],
        output: vec![Some(ctrl.clone())],
    };
    run(&model, &inputs, Some(&control), &options)?;
    let controlled = recorder.seen();

    assert_eq!(
        flat(&controlled.narrow(1, 0, TXT_LEN)?),
        flat(&plain.narrow(1, 0, TXT_LEN)?)
    );
    assert_eq!(
        flat(&controlled.narrow(1, TXT_LEN, n_img)?),
        flat(&(plain.narrow(1, TXT_LEN, n_img)? + ctrl)?)
    );
    Ok(())
}

#[test]
fn batch_one_controls_broadcast_over_batch() -> Result<()> {
    let (model, _) = tiny_model()?;
    let inputs = inputs(4, 6)?;
    let n_img = inputs.patched.num_tokens();
    let double = Arc::new(Recorder::default());
    let single = Arc::new(Recorder::default());
    let options = TransformerOptions::new()
        .with_double_block_patch(1, double.clone())
        .with_single_block_patch(1, single.clone());

    run(&model, &inputs, None, &options)?;
    let plain_double = double.seen();

    let ctrl = Tensor::randn(0f32, 1., (1, n_img, 16), &Device::Cpu)?;
    let control = Control {
        input: vec![Some(ctrl.clone())],
        output: vec![Some(ctrl.clone())],
    };
    let out = run(&model, &inputs, Some(&control), &options)?;
    assert_eq!(out.dims(), &[2, n_img, 16]);
    assert_eq!(
        flat(&double.seen()),
        flat(&plain_double.broadcast_add(&ctrl)?)
    );
    assert_eq!(single.seen().dims(), &[2, TXT_LEN + n_img, 16]);
    Ok(())
}

#[test]
fn single_block_hook_output_feeds_next_block() -> Result<()> {
    let (model, _) = tiny_model()?;
    let inputs = inputs(4, 6)?;
    let recorder = Arc::new(Recorder::default());
    let options = TransformerOptions::new()
        .with_single_block_patch(0, Arc::new(Zeroing))
        .with_single_block_patch(1, recorder.clone());
    run(&model, &inputs, None, &options)?;
    let seen = recorder.seen();
    assert_eq!(seen.dims(), &[2, TXT_LEN + 6, 16]);
    assert!(flat(&seen).iter().all(|v| *v == 0.));
    Ok(())
}

#[test]
fn double_block_hooks_can_defer_or_replace() -> Result<()> {
    let (model, _) = tiny_model()?;
    let inputs = inputs(4, 6)?;
    let plain = run(&model, &inputs, None, &TransformerOptions::default())?;

    let deferring = TransformerOptions::new()
        .with_double_block_patch(0, Arc::new(Recorder::default()))
        .with_single_block_patch(2, Arc::new(Recorder::default()));
    assert_eq!(flat(&run(&model, &inputs, None, &deferring)?), flat(&plain));

    let replacing = TransformerOptions::new().with_double_block_patch(0, Arc::new(Passthrough));
    assert_ne!(flat(&run(&model, &inputs, None, &replacing)?), flat(&plain));
    Ok(())
}

#[test]
fn spatial_forward_preserves_shape() -> Result<()> {
    let (model, _) = tiny_model()?;
    for (h, w) in [(4, 6), (5, 7)] {
        let inputs = inputs(h, w)?;
        let y = Tensor::zeros((2, 8), DType::F32, &Device::Cpu)?;
        let out = model.forward(
            &inputs.latent,
            &inputs.timestep,
            &inputs.context,
            Some(&y),
            None,
            None,
            &TransformerOptions::default(),
        )?;
        assert_eq!(out.dims(), &[2, 4, h, w]);
    }
    Ok(())
}

#[test]
fn spatial_forward_rejects_flat_latents() -> Result<()> {
    let (model, _) = tiny_model()?;
    let inputs = inputs(4, 6)?;
    let err = model
        .forward(
            &inputs.patched.img,
            &inputs.timestep,
            &inputs.context,
            None,
            None,
            None,
            &TransformerOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::Shape { name: "x", .. }));
    Ok(())
}

fn temp_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "fluxdeclip-{}-{name}.safetensors",
        std::process::id()
    ))
}

fn cpu_f32() -> LoadConfig {
    LoadConfig {
        dtype: ModelDType::F32,
        device: Device::Cpu,
    }
}

#[test]
fn loads_nested_checkpoint_with_adapter() -> Result<()> {
    let (model, weights) = tiny_model()?;
    let (adapter, trunk): (HashMap<_, _>, HashMap<_, _>) = weights
        .into_iter()
        .partition(|(name, _)| name.starts_with("distilled_guidance_layer."));
    let mut nested: HashMap<String, Tensor> = trunk
        .into_iter()
        .map(|(name, t)| (format!("model.diffusion_model.{name}"), t))
        .collect();
    nested.insert(
        "first_stage_model.decoder.conv_in.weight".to_string(),
        Tensor::zeros(3, DType::F32, &Device::Cpu)?,
    );

    let model_path = temp_file("nested");
    let adapter_path = temp_file("adapter");
    candle_core::safetensors::save(&nested, &model_path)?;
    candle_core::safetensors::save(&adapter, &adapter_path)?;

    let loaded = load_fluxdeclip(&model_path, Some(adapter_path.as_path()), &tiny_params(), &cpu_f32())?;
    let inputs = inputs(4, 6)?;
    let options = TransformerOptions::default();
    assert_eq!(
        flat(&run(&loaded, &inputs, None, &options)?),
        flat(&run(&model, &inputs, None, &options)?)
    );

    let _ = std::fs::remove_file(model_path);
    let _ = std::fs::remove_file(adapter_path);
    Ok(())
}

#[test]
fn loader_rejects_unexpected_and_missing_keys() -> Result<()> {
    let (_, weights) = tiny_model()?;

    let mut extra = weights.clone();
    extra.insert(
        "double_blocks.0.img_mod.lin.weight".to_string(),
        Tensor::zeros((96, 16), DType::F32, &Device::Cpu)?,
    );
    let extra_path = temp_file("extra");
    candle_core::safetensors::save(&extra, &extra_path)?;
    let err = load_fluxdeclip(&extra_path, None, &tiny_params(), &cpu_f32()).unwrap_err();
    assert!(matches!(err, Error::StateLoad { .. }));

    let mut missing = weights;
    missing.remove("final_layer.linear.weight");
    let missing_path = temp_file("missing");
    candle_core::safetensors::save(&missing, &missing_path)?;
    let err = load_fluxdeclip(&missing_path, None, &tiny_params(), &cpu_f32()).unwrap_err();
    assert!(matches!(err, Error::StateLoad { .. }));

    let _ = std::fs::remove_file(extra_path);
    let _ = std::fs::remove_file(missing_path);
    Ok(())
}

#[test]
fn loader_rejects_layers_beyond_the_config() -> Result<()> {
    let (_, weights) = tiny_model()?;

    let mut deeper = weights.clone();
    deeper.insert(
        "distilled_guidance_layer.layers.7.in_layer.weight".to_string(),
        Tensor::zeros((32, 32), DType::F32, &Device::Cpu)?,
    );
    deeper.insert(
        "distilled_guidance_layer.norms.9.scale".to_string(),
        Tensor::zeros(32, DType::F32, &Device::Cpu)?,
    );
    let deeper_path = temp_file("deeper-approximator");
    candle_core::safetensors::save(&deeper, &deeper_path)?;
    let err = load_fluxdeclip(&deeper_path, None, &tiny_params(), &cpu_f32()).unwrap_err();
    assert!(matches!(err, Error::StateLoad { .. }));

    let no_bias = FluxParams {
        qkv_bias: false,
        ..tiny_params()
    };
    let mut biased = random_weights(&no_bias)?;
    biased.insert(
        "double_blocks.0.img_attn.qkv.bias".to_string(),
        Tensor::zeros(48, DType::F32, &Device::Cpu)?,
    );
    let biased_path = temp_file("unused-qkv-bias");
    candle_core::safetensors::save(&biased, &biased_path)?;
    let err = load_fluxdeclip(&biased_path, None, &no_bias, &cpu_f32()).unwrap_err();
    assert!(matches!(err, Error::StateLoad { .. }));

    let _ = std::fs::remove_file(deeper_path);
    let _ = std::fs::remove_file(biased_path);
    Ok(())
}

#[test]
fn loader_reports_wrong_weight_shapes() -> Result<()> {
    let (_, mut weights) = tiny_model()?;
    weights.insert(
        "img_in.weight".to_string(),
        Tensor::zeros((16, 12), DType::F32, &Device::Cpu)?,
    );
    let path = temp_file("wrong-shape");
    candle_core::safetensors::save(&weights, &path)?;
    let err = load_fluxdeclip(&path, None, &tiny_params(), &cpu_f32()).unwrap_err();
    assert!(matches!(err, Error::StateLoad { .. }));
    let _ = std::fs::remove_file(path);
    Ok(())
}
