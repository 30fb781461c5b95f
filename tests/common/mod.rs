#![allow(dead_code)]

use burn::backend::{Autodiff, NdArray};
use burn::tensor::{DType, Tensor, TensorData};
use food_model_convert::checkpoint::{Entry, StateDict};
use food_model_convert::config::{DEFAULT_CHECKPOINT, NUM_CLASSES};
use food_model_convert::model::ResNetConfig;
use food_model_convert::trace::TracedModule;
use food_model_convert::ConvertConfig;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;

pub type TestBackend = NdArray<f32>;
pub type TestAutodiffBackend = Autodiff<TestBackend>;

/// A ResNet small enough to convert in a test, with the real number of classes.
pub fn narrow_model() -> ResNetConfig {
    ResNetConfig::new(NUM_CLASSES)
        .with_blocks([1, 1, 1, 1])
        .with_base_width(4)
}

pub fn narrow_config() -> ConvertConfig {
    ConvertConfig::new(narrow_model())
}

/// Parameters of a freshly initialized narrow model, as a training run would save them.
pub fn trained_state() -> StateDict {
    narrow_model()
        .init::<TestBackend>(&Default::default())
        .expect("valid config")
        .state_dict()
}

/// `state` with a training-loop integer saved next to the parameters, e.g. `epoch`.
pub fn with_int_entry(state: StateDict, name: &str, first: bool) -> StateDict {
    let extra = (name.to_string(), Entry::Other("int".to_string()));
    match first {
        true => std::iter::once(extra).chain(state).collect(),
        false => state.into_iter().chain(std::iter::once(extra)).collect(),
    }
}

pub fn with_wrapper_prefix(state: StateDict) -> StateDict {
    state
        .into_iter()
        .map(|(name, value)| (format!("module.{name}"), value))
        .collect()
}

/// Writes `state` where the default configuration expects the checkpoint under `root`.
pub fn install_checkpoint(root: &Path, state: &StateDict) -> PathBuf {
    let path = root.join(DEFAULT_CHECKPOINT);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    write_checkpoint(&path, state);
    path
}

/// Writes `state` the way `torch.save(model.state_dict(), path)` does: a zip archive holding
/// a protocol 2 pickle of an `OrderedDict` and one raw storage per tensor.
pub fn write_checkpoint(path: &Path, state: &StateDict) {
    let mut pickle = vec![0x80, 2];
    global(&mut pickle, "collections", "OrderedDict");
    pickle.extend([b')', b'R', b'(']);

    let mut storages = Vec::new();
    for (index, (name, entry)) in state.iter().enumerate() {
        let data = match entry {
            Entry::Tensor(data) => data,
            // Only the type of a plain value survives loading.
            Entry::Other(kind) if kind == "int" => {
                unicode(&mut pickle, name);
                int(&mut pickle, 5);
                continue;
            }
            Entry::Other(kind) => panic!("unsupported fixture value {kind}"),
        };
        let (storage_type, bytes) = match data.dtype {
            DType::F32 => (
                "FloatStorage",
                data.to_vec::<f32>()
                    .unwrap()
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect::<Vec<_>>(),
            ),
            DType::I64 => (
                "LongStorage",
                data.to_vec::<i64>()
                    .unwrap()
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect::<Vec<_>>(),
            ),
            other => panic!("unsupported fixture dtype {other:?}"),
        };
        let key = index.to_string();

        unicode(&mut pickle, name);
        global(&mut pickle, "torch._utils", "_rebuild_tensor_v2");
        pickle.extend([b'(', b'(']);
        unicode(&mut pickle, "storage");
        global(&mut pickle, "torch", storage_type);
        unicode(&mut pickle, &key);
        unicode(&mut pickle, "cpu");
        int(&mut pickle, data.num_elements());
        pickle.extend([b't', b'Q']);
        int(&mut pickle, 0);
        tuple(&mut pickle, &data.shape);
        tuple(&mut pickle, &contiguous_strides(&data.shape));
        pickle.push(0x89);
        global(&mut pickle, "collections", "OrderedDict");
        pickle.extend([b')', b'R', b't', b'R']);

        storages.push((key, bytes));
    }
    pickle.extend([b'u', b'.']);

    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file("best_food_model/data.pkl", options).unwrap();
    zip.write_all(&pickle).unwrap();
    for (key, bytes) in storages {
        zip.start_file(format!("best_food_model/data/{key}"), options)
            .unwrap();
        zip.write_all(&bytes).unwrap();
    }
    zip.finish().unwrap();
}

fn unicode(out: &mut Vec<u8>, s: &str) {
    out.push(b'X');
    out.extend((s.len() as u32).to_le_bytes());
    out.extend(s.as_bytes());
}

fn global(out: &mut Vec<u8>, module: &str, name: &str) {
    out.push(b'c');
    out.extend(format!("{module}\n{name}\n").as_bytes());
}

fn int(out: &mut Vec<u8>, value: usize) {
    out.push(b'J');
    out.extend((value as i32).to_le_bytes());
}

fn tuple(out: &mut Vec<u8>, values: &[usize]) {
    out.push(b'(');
    for value in values {
        int(out, *value);
    }
    out.push(b't');
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// A fixed, non-trivial image batch.
pub fn sample_input(device: &<TestBackend as burn::tensor::backend::Backend>::Device) -> Tensor<TestBackend, 4> {
    let values: Vec<f32> = (0..3 * 224 * 224)
        .map(|i| ((i % 255) as f32 / 127.5) - 1.0)
        .collect();
    Tensor::from_data(TensorData::new(values, [1, 3, 224, 224]), device)
}

/// Runs the artifact at `path` on [sample_input].
pub fn infer(path: &Path) -> Vec<f32> {
    let device = Default::default();
    let module = TracedModule::<TestBackend>::load(path, &device).unwrap();
    module
        .forward(sample_input(&device))
        .unwrap()
        .into_data()
        .to_vec::<f32>()
        .unwrap()
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {i}: {a} differs from {e} by more than {tolerance}"
        );
    }
}
