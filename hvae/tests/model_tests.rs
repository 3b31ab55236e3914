use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Tensor};
use hvae::candle_distributions::{Distribution, Family};
use hvae::config::{ArchConfig, EncodingForm, ModelConfig, TrainConfig};
use hvae::{FullyConnectedModel, ModelError, Result};
use std::collections::HashSet;

fn two_level_config(family: Family, forms: Vec<EncodingForm>) -> ModelConfig {
    ModelConfig {
        train_config: TrainConfig {
            batch_size: 8,
            output_distribution: family,
            ..Default::default()
        },
        arch: ArchConfig {
            n_input: 20,
            inference_input_form: forms,
            n_latent: vec![64, 32],
            n_layers_inf: vec![2, 2],
            n_units_inf: vec![48, 48],
            n_layers_gen: vec![2, 2, 1],
            n_units_gen: vec![48, 48, 1],
            ..Default::default()
        },
    }
}

fn has_nan(x: &Tensor) -> Result<bool> {
    let n_nan = x.ne(x)?.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    Ok(n_nan > 0.0)
}

#[test]
fn zero_observation_two_levels() -> Result<()> {
    let config = two_level_config(Family::Bernoulli, vec![EncodingForm::Observation]);
    let mut model = FullyConnectedModel::new(&config, DType::F32, &Device::Cpu)?;

    let x = Tensor::zeros((8, 20), DType::F32, &Device::Cpu)?;
    model.infer(&x)?;
    let generation = model.generate(false, 1)?;

    assert_eq!(generation.sample.dims(), &[8, 20]);
    assert!(!has_nan(&generation.sample)?);
    assert!(!has_nan(&generation.output.mean()?)?);
    Ok(())
}

#[test]
fn posterior_generation_with_every_input_form() -> Result<()> {
    let forms = vec![
        EncodingForm::Observation,
        EncodingForm::Gradient,
        EncodingForm::Error,
    ];
    let config = two_level_config(Family::Normal, forms);
    let mut model = FullyConnectedModel::new(&config, DType::F32, &Device::Cpu)?;

    let x = Tensor::rand(0f32, 1f32, (8, 20), &Device::Cpu)?;
    model.re_init()?;
    model.infer(&x)?;
    let generation = model.generate(false, 3)?;

    assert_eq!(generation.sample.dims(), &[24, 20]);
    assert_eq!(generation.batch_size, 8);
    assert_eq!(model.kl_divergences()?.len(), 2);

    // 20 + 4 * 64 + (20 + 3 * 64)
    assert_eq!(model.encoding_form(&x)?.dims(), &[8, 488]);
    Ok(())
}

#[test]
fn prior_samples_need_no_inference() -> Result<()> {
    let config = two_level_config(Family::Normal, vec![EncodingForm::Observation]);
    let mut model = FullyConnectedModel::new(&config, DType::F32, &Device::Cpu)?;

    let first = model.generate(true, 1)?.sample;
    let second = model.generate(true, 1)?.sample;

    assert_eq!(first.dims(), &[8, 20]);
    assert_eq!(first.dims(), second.dims());
    let diff = (first - second)?.abs()?.sum_all()?.to_scalar::<f32>()?;
    assert!(diff > 0.0);
    Ok(())
}

#[test]
fn posterior_generation_before_inference_fails() -> Result<()> {
    let config = two_level_config(Family::Bernoulli, vec![EncodingForm::Observation]);
    let mut model = FullyConnectedModel::new(&config, DType::F32, &Device::Cpu)?;
    assert!(matches!(
        model.generate(false, 1),
        Err(ModelError::MissingState(_))
    ));
    Ok(())
}

#[test]
fn re_init_does_not_leak_the_posterior() -> Result<()> {
    let mut config = two_level_config(Family::Bernoulli, vec![EncodingForm::Observation]);
    config.train_config.batch_size = 4000;
    let mut model = FullyConnectedModel::new(&config, DType::F32, &Device::Cpu)?;
    model.set_train(false);

    let reference = model.generate(true, 1)?.output.mean()?.mean(0)?;

    // an extreme observation drives the posterior far from the prior
    let x = (Tensor::ones((4000, 20), DType::F32, &Device::Cpu)? * 50.0)?;
    model.infer(&x)?;
    model.generate(false, 1)?;

    model.re_init()?;
    let bottom = &model.levels()[0];
    let [post_mean, post_log_var] = bottom.latent().approx_posterior_parameters()?;
    let prior = bottom.latent().prior().ok_or(ModelError::MissingState("prior"))?;
    let gap = (post_mean - prior.mean())?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert_eq!(gap, 0.0);
    let gap = (post_log_var - prior.log_var())?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert_eq!(gap, 0.0);

    let after = model.generate(true, 1)?.output.mean()?.mean(0)?;
    let reference = reference.to_vec1::<f32>()?;
    let after = after.to_vec1::<f32>()?;
    for (a, b) in reference.iter().zip(after.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 0.05);
    }
    Ok(())
}

#[test]
fn parameter_partitions_cover_every_variable_once() -> Result<()> {
    let mut config = two_level_config(Family::Normal, vec![EncodingForm::Observation]);
    config.arch.learn_top_prior = true;
    config.arch.constant_prior_variances = true;
    config.arch.batch_norm_gen = true;
    let model = FullyConnectedModel::new(&config, DType::F32, &Device::Cpu)?;

    let inference = model.inference_parameters()?;
    let generative = model.generative_parameters()?;

    let inf_ids = inference.iter().map(|v| v.id()).collect::<HashSet<_>>();
    let gen_ids = generative.iter().map(|v| v.id()).collect::<HashSet<_>>();
    assert_eq!(inf_ids.len(), inference.len());
    assert_eq!(gen_ids.len(), generative.len());
    assert!(inf_ids.is_disjoint(&gen_ids));

    let all_ids = model
        .varmap()
        .all_vars()
        .iter()
        .map(|v| v.id())
        .collect::<HashSet<_>>();
    let union = inf_ids.union(&gen_ids).copied().collect::<HashSet<_>>();
    assert_eq!(union, all_ids);
    Ok(())
}

#[test]
fn observation_form_is_exact() -> Result<()> {
    let config = two_level_config(Family::Bernoulli, vec![EncodingForm::Observation]);
    let model = FullyConnectedModel::new(&config, DType::F32, &Device::Cpu)?;
    let x = Tensor::rand(0f32, 1f32, (8, 20), &Device::Cpu)?;
    let enc = model.encoding_form(&x)?.to_vec2::<f32>()?;
    let x = x.to_vec2::<f32>()?;
    for (enc_row, x_row) in enc.iter().zip(x.iter()) {
        for (e, v) in enc_row.iter().zip(x_row.iter()) {
            assert_eq!(*e, v - 0.5);
        }
    }
    Ok(())
}

#[test]
fn bernoulli_output_error_is_unimplemented() -> Result<()> {
    let config = two_level_config(Family::Bernoulli, vec![EncodingForm::Observation]);
    let mut model = FullyConnectedModel::new(&config, DType::F32, &Device::Cpu)?;
    let x = Tensor::zeros((8, 20), DType::F32, &Device::Cpu)?;
    model.infer(&x)?;
    let generation = model.generate(false, 1)?;

    let err = model.output_error(&x, &generation);
    assert!(matches!(
        err,
        Err(ModelError::UnsupportedOutput {
            family: Family::Bernoulli
        })
    ));
    Ok(())
}

#[test]
fn error_form_with_bernoulli_output_is_rejected() {
    let config = two_level_config(Family::Bernoulli, vec![EncodingForm::Error]);
    assert!(matches!(
        FullyConnectedModel::new(&config, DType::F32, &Device::Cpu),
        Err(ModelError::Config(_))
    ));
}
