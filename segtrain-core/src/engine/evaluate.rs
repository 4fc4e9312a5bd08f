//! Sharded inference and COCO evaluation on the test datasets.

use super::EngineContext;
use crate::config::RunConfig;
use crate::data::{DatasetRecord, inference_shard, load_image_chw};
use crate::error::Result;
use crate::evaluation::{CocoPrediction, EvaluationResults, IouType, evaluate};
use crate::modeling::{Instance, MaskDetector, PostprocessParams, postprocess};
use crate::persistence::atomic_write_json;
use burn::tensor::{Tensor, TensorData, backend::Backend};
use std::collections::BTreeMap;

const INFERENCE_BATCH: usize = 4;

/// Predict instances for `records`, in order, at original image resolution.
pub fn inference_on_records<B: Backend>(
    model: &MaskDetector<B>,
    records: &[DatasetRecord],
    input_size: usize,
    params: PostprocessParams,
    device: &B::Device,
) -> Result<Vec<Vec<Instance>>> {
    let mut out = Vec::with_capacity(records.len());
    for chunk in records.chunks(INFERENCE_BATCH) {
        let mut pixels = Vec::with_capacity(chunk.len() * 3 * input_size * input_size);
        let mut sizes = Vec::with_capacity(chunk.len());
        for record in chunk {
            let (chw, _) = load_image_chw(&record.file_name, input_size)?;
            pixels.extend_from_slice(&chw);
            sizes.push((record.width, record.height));
        }
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [chunk.len(), 3, input_size, input_size]),
            device,
        );
        out.extend(postprocess(model.forward(images), &sizes, params)?);
    }
    Ok(out)
}

/// Evaluate on every test dataset. The main process returns
/// `task -> metric -> value`; other ranks return an empty result.
pub async fn do_evaluate<B: Backend>(
    ctx: &EngineContext<'_>,
    cfg: &RunConfig,
    model: &MaskDetector<B>,
    device: &B::Device,
) -> Result<EvaluationResults> {
    let params = PostprocessParams::from_test_config(&cfg.test);
    let mut per_dataset = BTreeMap::new();

    for name in &cfg.datasets.test {
        let records = ctx.registry.get(name)?;
        let metadata = ctx.registry.metadata(name)?;
        let shard = inference_shard(records.len(), ctx.world.rank, ctx.world.world_size);
        tracing::info!(dataset = %name, images = shard.len(), rank = ctx.world.rank, "running inference");

        let start = std::time::Instant::now();
        let local = &records[shard.clone()];
        let instances = inference_on_records(model, local, cfg.input.size, params, device)?;
        let mut predictions = Vec::new();
        for (record, found) in local.iter().zip(&instances) {
            for instance in found {
                predictions.push(CocoPrediction::from_instance(
                    record.image_id,
                    instance,
                    &metadata.category_ids,
                )?);
            }
        }
        tracing::info!(
            dataset = %name,
            seconds = start.elapsed().as_secs_f64(),
            "inference done"
        );

        let gathered = ctx.comm.gather_json(&predictions).await?;
        if !ctx.world.is_main_process() {
            continue;
        }
        let mut all: Vec<CocoPrediction> = gathered.into_iter().flatten().collect();
        all.sort_by_key(|p| p.image_id);

        let out_dir = cfg.output_dir.join("inference").join(name);
        std::fs::create_dir_all(&out_dir)?;
        let results_file = out_dir.join("coco_instances_results.json");
        atomic_write_json(&results_file, &all)?;
        tracing::info!(file = %results_file.display(), predictions = all.len(), "saved predictions");

        let mut results = EvaluationResults::default();
        for iou_type in [IouType::Bbox, IouType::Segm] {
            let detections = all
                .iter()
                .map(|p| p.to_detection(&metadata.category_ids, iou_type == IouType::Segm))
                .collect::<Result<Vec<_>>>()?;
            let metrics = evaluate(&records, &detections, iou_type, &metadata.thing_classes)?;
            log_metrics(name, iou_type, &metrics);
            results.insert(iou_type.as_str(), metrics);
        }
        per_dataset.insert(name.clone(), results);
    }
    ctx.comm.barrier().await?;

    Ok(match per_dataset.len() {
        0 => EvaluationResults::default(),
        1 => per_dataset.into_values().next().unwrap_or_default(),
        _ => {
            let mut merged = EvaluationResults::default();
            for (dataset, results) in per_dataset {
                for (task, metrics) in results.0 {
                    merged.insert(format!("{dataset}/{task}"), metrics);
                }
            }
            merged
        }
    })
}

fn log_metrics(dataset: &str, iou_type: IouType, metrics: &BTreeMap<String, f64>) {
    let summary: Vec<String> = ["AP", "AP50", "AP75", "APs", "APm", "APl"]
        .iter()
        .filter_map(|k| metrics.get(*k).map(|v| format!("{k}={v:.3}")))
        .collect();
    tracing::info!(
        dataset,
        task = iou_type.as_str(),
        "evaluation results: {}",
        summary.join(" ")
    );
}
