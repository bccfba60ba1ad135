use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Result;
use backbone::{registry, ParameterMap};
use candle_core::{DType, Device, Tensor};
use extraction::{
    trainer::init_state, ClusterConfig, DistBackend, ExtractionError, LoggingConfig,
    ModelOverrides, RunOutcome, Trainer, TrainerConfig, TrainerPhase, COMPLETION_VALUE,
};
use image::{Rgb, RgbImage};
use tempfile::TempDir;

const ARCH: &str = "ResNet50";

struct Fixture {
    dir: TempDir,
    train: TrainerConfig,
    cluster: ClusterConfig,
    pretrained: ParameterMap,
}

impl Fixture {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();

        for (class, count) in [("cat", 3u8), ("dog", 2u8)] {
            let class_dir = root.join("data").join(class);
            fs::create_dir_all(&class_dir)?;
            for index in 0..count {
                let shade = 40 * index + if class == "cat" { 0 } else { 120 };
                RgbImage::from_pixel(40, 36, Rgb([shade, 255 - shade, shade / 2]))
                    .save(class_dir.join(format!("img{index}.png")))?;
            }
        }

        let train = TrainerConfig {
            architecture: ARCH.into(),
            dataset_path: root.join("data"),
            weight_path: root.join("pretrained.safetensors"),
            save_folder: root.join("runs"),
            save_path: format!("{}/features/val_", root.display()),
            job_id: "777".into(),
            batch_per_gpu: 2,
            workers: 2,
            input_size: 32,
            local_rank: 0,
            global_rank: 0,
            num_tasks: 1,
            seed: 0,
            weight_prefix: "module.".into(),
            shard_by_rank: true,
            preprocessing: None,
            model: ModelOverrides {
                num_classes: Some(3),
                layers: Some([1, 1, 1, 1]),
                stem_width: Some(4),
                ..ModelOverrides::default()
            },
        };
        let cluster = ClusterConfig {
            dist_backend: DistBackend::Gloo,
            dist_url: format!("file://{}", root.join("init").display()),
            rendezvous_timeout_secs: 10,
            poll_interval_ms: 5,
        };

        let entry = registry::lookup(ARCH).expect("registered architecture");
        let source = entry.build(train.resolve_backbone_config(&Device::Cpu)?)?;
        let pretrained: ParameterMap = source
            .named_parameters()?
            .into_iter()
            .map(|(name, tensor)| (format!("module.{name}"), tensor))
            .collect();
        let mut on_disk: HashMap<String, Tensor> = pretrained.clone().into_iter().collect();
        on_disk.insert(
            "module.bn1.num_batches_tracked".into(),
            Tensor::zeros((), DType::I64, &Device::Cpu)?,
        );
        candle_core::safetensors::save(&on_disk, &train.weight_path)?;

        Ok(Self {
            dir,
            train,
            cluster,
            pretrained,
        })
    }

    fn trainer(&self) -> Trainer {
        Trainer::new(self.train.clone(), self.cluster.clone()).with_logging(LoggingConfig {
            progress: false,
            ..LoggingConfig::default()
        })
    }

    fn ranked_trainer(&self, rank: usize, world: usize) -> Trainer {
        let mut train = self.train.clone();
        train.global_rank = rank;
        train.num_tasks = world;
        Trainer::new(train, self.cluster.clone()).with_logging(LoggingConfig {
            progress: false,
            ..LoggingConfig::default()
        })
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }
}

fn values(params: &ParameterMap) -> Result<Vec<(String, Vec<f32>)>> {
    params
        .iter()
        .map(|(name, tensor)| {
            Ok((
                name.clone(),
                tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
            ))
        })
        .collect()
}

fn read_npy(path: &Path) -> Result<Tensor> {
    Ok(Tensor::read_npy(path)?)
}

#[test]
fn extraction_writes_aligned_outputs() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut runtime = fixture.trainer().launch()?;
    assert_eq!(runtime.phase(), TrainerPhase::StateReady);
    assert_eq!(runtime.epoch(), 0);
    assert_eq!(
        values(&runtime.state().model.state_dict()?)?,
        values(&fixture.pretrained)?
    );

    let outcome = runtime.run(|| false)?;

    assert_eq!(outcome, RunOutcome::Completed(COMPLETION_VALUE));
    assert_eq!(runtime.phase(), TrainerPhase::Done);
    assert_eq!(runtime.epoch(), 1);

    let labels = read_npy(&fixture.path("features/val_labels.npy"))?;
    let embeddings = read_npy(&fixture.path("features/val_ResNet50_embedding.npy"))?;
    let softmax = read_npy(&fixture.path("features/val_ResNet50_softmax.npy"))?;
    assert_eq!(labels.to_vec1::<i64>()?, vec![0, 0, 0, 1, 1]);
    assert_eq!(embeddings.dims(), &[5, 128]);
    assert_eq!(softmax.dims(), &[5, 3]);
    for row in softmax.to_vec2::<f32>()? {
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }

    assert!(runtime.run(|| false).is_err(), "a runtime extracts once");
    Ok(())
}

#[test]
fn preemption_checkpoints_and_requeues() -> Result<()> {
    let fixture = Fixture::new()?;
    let endpoint = fixture.path("init");

    let mut runtime = fixture.trainer().launch()?;
    assert!(endpoint.is_file());
    assert_eq!(runtime.run(|| true)?, RunOutcome::Interrupted);
    assert!(!fixture.path("features/val_labels.npy").exists());
    let before = values(&runtime.state().model.state_dict()?)?;

    let requeued = runtime.checkpoint(true)?;

    assert!(!endpoint.exists());
    assert!(fixture.path("runs/777/checkpoint.pth").is_file());
    assert!(fixture.path("runs/777/checkpoint_0.pth").is_file());
    assert_eq!(requeued.phase(), TrainerPhase::Unstarted);

    let descriptor = fixture.path("runs/777/requeue.json");
    requeued.write_descriptor(&descriptor)?;
    let relaunched = Trainer::read_descriptor(&descriptor)?;

    let mut resumed = relaunched.launch()?;
    assert_eq!(values(&resumed.state().model.state_dict()?)?, before);
    assert_eq!(resumed.run(|| false)?, RunOutcome::Completed(0.0));
    assert_eq!(resumed.epoch(), 1);

    resumed.checkpoint(true)?;
    assert!(fixture.path("runs/777/checkpoint_1.pth").is_file());
    Ok(())
}

#[test]
fn checkpoint_without_requeue_keeps_endpoint() -> Result<()> {
    let fixture = Fixture::new()?;
    let runtime = fixture.trainer().launch()?;

    let trainer = runtime.checkpoint(false)?;

    assert!(fixture.path("init").is_file());
    let err = trainer.launch().unwrap_err();
    assert!(matches!(err, ExtractionError::Rendezvous(_)));
    Ok(())
}

#[test]
fn state_init_is_idempotent_against_a_checkpoint() -> Result<()> {
    let fixture = Fixture::new()?;
    let (_, state) = init_state(&fixture.train, &Device::Cpu)?;
    state.save(&fixture.train.checkpoint_path())?;

    let (_, first) = init_state(&fixture.train, &Device::Cpu)?;
    let (_, second) = init_state(&fixture.train, &Device::Cpu)?;

    assert_eq!(
        values(&first.model.state_dict()?)?,
        values(&second.model.state_dict()?)?
    );
    assert_eq!(first.epoch, second.epoch);
    Ok(())
}

#[test]
fn corrupt_checkpoint_is_fatal() -> Result<()> {
    let fixture = Fixture::new()?;
    let checkpoint = fixture.train.checkpoint_path();
    fs::create_dir_all(checkpoint.parent().expect("job directory"))?;
    fs::write(&checkpoint, b"not a checkpoint")?;

    let err = init_state(&fixture.train, &Device::Cpu).unwrap_err();

    assert!(matches!(err, ExtractionError::Checkpoint(_)));
    Ok(())
}

#[test]
fn incomplete_pretrained_weights_abort_launch() -> Result<()> {
    let fixture = Fixture::new()?;
    let partial: HashMap<String, Tensor> = fixture
        .pretrained
        .iter()
        .filter(|(name, _)| !name.starts_with("module.fc."))
        .map(|(name, tensor)| (name.clone(), tensor.clone()))
        .collect();
    candle_core::safetensors::save(&partial, &fixture.train.weight_path)?;

    let err = init_state(&fixture.train, &Device::Cpu).unwrap_err();

    match err {
        ExtractionError::WeightCoverage {
            matched,
            total,
            missing,
        } => {
            assert_eq!(total, fixture.pretrained.len());
            assert_eq!(matched, total - 2);
            assert!(missing.contains("fc.weight"));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn ranks_extract_disjoint_shards() -> Result<()> {
    let fixture = Fixture::new()?;
    let world = 2;

    let handles: Vec<_> = (0..world)
        .map(|rank| {
            let trainer = fixture.ranked_trainer(rank, world);
            thread::spawn(move || trainer.call())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().expect("rank thread")?, Some(0.0));
    }

    let rank0 = read_npy(&fixture.path("features/val_rank0_labels.npy"))?.to_vec1::<i64>()?;
    let rank1 = read_npy(&fixture.path("features/val_rank1_labels.npy"))?.to_vec1::<i64>()?;
    assert_eq!(rank0, vec![0, 0, 1]);
    assert_eq!(rank1, vec![0, 1]);
    assert_eq!(
        read_npy(&fixture.path("features/val_rank1_ResNet50_embedding.npy"))?.dims(),
        &[2, 128]
    );
    Ok(())
}

#[test]
fn preempted_ranks_requeue_through_their_own_descriptors() -> Result<()> {
    let fixture = Fixture::new()?;
    let world = 2;
    let shutdown = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..world)
        .map(|rank| {
            let trainer = fixture.ranked_trainer(rank, world);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || -> extraction::Result<PathBuf> {
                let mut runtime = trainer.launch()?;
                shutdown.store(true, Ordering::Relaxed);
                let outcome = runtime.run(|| shutdown.load(Ordering::Relaxed))?;
                assert_eq!(outcome, RunOutcome::Interrupted);
                runtime.requeue(true)
            })
        })
        .collect();
    let mut descriptors = Vec::new();
    for handle in handles {
        descriptors.push(handle.join().expect("rank thread")?);
    }

    assert_eq!(
        descriptors,
        vec![
            fixture.path("runs/777/requeue_rank0.json"),
            fixture.path("runs/777/requeue_rank1.json"),
        ]
    );
    assert!(!fixture.path("runs/777/requeue.json").exists());
    assert!(fixture.path("runs/777/checkpoint.pth").is_file());
    assert!(!fixture.path("init").exists());

    let relaunched: Vec<Trainer> = descriptors
        .iter()
        .map(|path| Trainer::read_descriptor(path))
        .collect::<extraction::Result<_>>()?;
    for (rank, trainer) in relaunched.iter().enumerate() {
        assert_eq!(trainer.train_cfg().global_rank, rank);
        assert_eq!(trainer.train_cfg().num_tasks, world);
    }

    let handles: Vec<_> = relaunched
        .into_iter()
        .map(|trainer| thread::spawn(move || trainer.call()))
        .collect();
    for handle in handles {
        assert_eq!(handle.join().expect("rank thread")?, Some(COMPLETION_VALUE));
    }
    let rank0 = read_npy(&fixture.path("features/val_rank0_labels.npy"))?.to_vec1::<i64>()?;
    assert_eq!(rank0, vec![0, 0, 1]);
    Ok(())
}

#[test]
fn shutdown_during_rendezvous_aborts_launch() -> Result<()> {
    let fixture = Fixture::new()?;
    let trainer = fixture.ranked_trainer(0, 2);

    let err = trainer.clone().launch_with_shutdown(|| true).unwrap_err();

    assert!(matches!(err, ExtractionError::Rendezvous(_)));
    assert!(err.to_string().contains("interrupted"));
    assert!(!fixture.path("init").exists());

    let descriptor = trainer.write_requeue_descriptor()?;
    assert_eq!(descriptor, fixture.path("runs/777/requeue_rank0.json"));
    assert_eq!(Trainer::read_descriptor(&descriptor)?.train_cfg().num_tasks, 2);
    Ok(())
}
