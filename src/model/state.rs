//! Moving parameters between modules and [StateDict]s by name.
//!
//! Layers name their tensors with [Leaf]s listed in the order [Module::map] and
//! [Module::visit] reach them; composite modules open a scope per field. The assignment itself
//! is a [ModuleMapper], the export a [ModuleVisitor].
use crate::checkpoint::{Entry, KeyPath, StateDict};
use crate::error::{NotATensor, ParameterMismatch, ShapeMismatch};
use burn::module::{Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, Linear};
use burn::tensor::{Tensor, TensorData, backend::Backend};
use std::collections::HashMap;
use std::fmt::Display;
use std::slice;

/// Checkpoint name of one tensor of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf {
    pub name: &'static str,
    /// Stored with its last two dimensions swapped relative to the module.
    pub transposed: bool,
}

impl Leaf {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            transposed: false,
        }
    }

    pub const fn transposed(name: &'static str) -> Self {
        Self {
            name,
            transposed: true,
        }
    }
}

const CONV2D: [Leaf; 2] = [Leaf::new("weight"), Leaf::new("bias")];
const BATCH_NORM: [Leaf; 4] = [
    Leaf::new("weight"),
    Leaf::new("bias"),
    Leaf::new("running_mean"),
    Leaf::new("running_var"),
];
const LINEAR: [Leaf; 2] = [Leaf::transposed("weight"), Leaf::new("bias")];

/// Step counter batch norm layers keep next to their statistics.
const BATCH_COUNTER: &str = "num_batches_tracked";

/// A module whose parameters can be read from and written to a [StateDict].
pub trait StateModule<B: Backend>: Sized {
    fn load(self, loader: &mut StateLoader) -> Self;

    fn export(&self, exporter: &mut StateExporter);
}

impl<B: Backend> StateModule<B> for Conv2d<B> {
    fn load(self, loader: &mut StateLoader) -> Self {
        loader.assign(self, &CONV2D)
    }

    fn export(&self, exporter: &mut StateExporter) {
        exporter.collect(self, &CONV2D);
    }
}

impl<B: Backend> StateModule<B> for BatchNorm<B, 2> {
    fn load(self, loader: &mut StateLoader) -> Self {
        let norm = loader.assign(self, &BATCH_NORM);
        loader.optional(BATCH_COUNTER);
        norm
    }

    fn export(&self, exporter: &mut StateExporter) {
        exporter.collect(self, &BATCH_NORM);
        exporter.counter(BATCH_COUNTER, 0);
    }
}

impl<B: Backend> StateModule<B> for Linear<B> {
    fn load(self, loader: &mut StateLoader) -> Self {
        loader.assign(self, &LINEAR)
    }

    fn export(&self, exporter: &mut StateExporter) {
        exporter.collect(self, &LINEAR);
    }
}

/// Elements are scoped by their index, e.g. `layer1.0`.
impl<B: Backend, T: StateModule<B>> StateModule<B> for Vec<T> {
    fn load(self, loader: &mut StateLoader) -> Self {
        self.into_iter()
            .enumerate()
            .map(|(i, module)| loader.scoped(i, |loader| module.load(loader)))
            .collect()
    }

    fn export(&self, exporter: &mut StateExporter) {
        for (i, module) in self.iter().enumerate() {
            exporter.scoped(i, |exporter| module.export(exporter));
        }
    }
}

impl<B: Backend, T: StateModule<B>> StateModule<B> for Option<T> {
    fn load(self, loader: &mut StateLoader) -> Self {
        self.map(|module| module.load(loader))
    }

    fn export(&self, exporter: &mut StateExporter) {
        if let Some(module) = self {
            module.export(exporter);
        }
    }
}

/// Assigns checkpoint values to parameters, collecting every disagreement on the way.
#[derive(Debug)]
pub struct StateLoader {
    entries: Vec<(String, Option<Entry>)>,
    index: HashMap<String, usize>,
    scope: KeyPath,
    mismatch: ParameterMismatch,
}

impl StateLoader {
    pub fn new(state: StateDict) -> Self {
        let entries: Vec<_> = state
            .into_iter()
            .map(|(name, value)| (name, Some(value)))
            .collect();
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();

        Self {
            entries,
            index,
            scope: KeyPath::default(),
            mismatch: ParameterMismatch::default(),
        }
    }

    /// Runs `f` with `name` appended to the parameter scope.
    pub fn scoped<R>(&mut self, name: impl Display, f: impl FnOnce(&mut Self) -> R) -> R {
        self.scope.push(name);
        let result = f(self);
        self.scope.pop();
        result
    }

    /// Replaces the tensors of `module`, in visiting order, with the checkpoint values of
    /// `leaves` under the current scope.
    pub fn assign<B: Backend, M: Module<B>>(&mut self, module: M, leaves: &[Leaf]) -> M {
        module.map(&mut Assign {
            loader: self,
            leaves: leaves.iter(),
        })
    }

    fn take(&mut self, name: &str) -> Option<Entry> {
        let index = *self.index.get(name)?;
        self.entries[index].1.take()
    }

    /// Returns the checkpoint value of `leaf`, or `current` when it is missing, is not a
    /// tensor or has the wrong shape. The problem is recorded either way.
    pub fn tensor<B: Backend, const D: usize>(
        &mut self,
        leaf: &Leaf,
        current: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let name = self.scope.key(leaf.name);
        let data = match self.take(&name) {
            Some(Entry::Tensor(data)) => data,
            Some(Entry::Other(found)) => {
                self.mismatch.not_tensors.push(NotATensor { name, found });
                return current;
            }
            None => {
                self.mismatch.missing.push(name);
                return current;
            }
        };

        let mut expected = current.dims().to_vec();
        if leaf.transposed && D >= 2 {
            expected.swap(D - 2, D - 1);
        }
        if data.shape != expected {
            self.mismatch.mismatched.push(ShapeMismatch {
                name,
                expected,
                found: data.shape,
            });
            return current;
        }

        let value = Tensor::from_data(data.convert::<B::FloatElem>(), &current.device());
        let value = match leaf.transposed {
            true => value.transpose(),
            false => value,
        };
        value.set_require_grad(current.is_require_grad())
    }

    /// Consumes `leaf` if the checkpoint has it, its absence is not an error.
    pub fn optional(&mut self, leaf: &str) {
        let name = self.scope.key(leaf);
        self.take(&name);
    }

    /// Succeeds when every expected parameter was found with the right shape and every
    /// checkpoint entry was used.
    pub fn finish(self) -> Result<(), ParameterMismatch> {
        let mut mismatch = self.mismatch;
        mismatch.unexpected = self
            .entries
            .into_iter()
            .filter(|(_, value)| value.is_some())
            .map(|(name, _)| name)
            .collect();

        match mismatch.is_empty() {
            true => Ok(()),
            false => Err(mismatch),
        }
    }
}

struct Assign<'a> {
    loader: &'a mut StateLoader,
    leaves: slice::Iter<'a, Leaf>,
}

impl<B: Backend> ModuleMapper<B> for Assign<'_> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.leaves.next() {
            Some(leaf) => self.loader.tensor(leaf, tensor),
            None => tensor,
        }
    }
}

/// Collects parameter values under their checkpoint names.
#[derive(Debug, Default)]
pub struct StateExporter {
    state: StateDict,
    scope: KeyPath,
}

impl StateExporter {
    pub fn scoped<R>(&mut self, name: impl Display, f: impl FnOnce(&mut Self) -> R) -> R {
        self.scope.push(name);
        let result = f(self);
        self.scope.pop();
        result
    }

    /// Stores the tensors of `module`, in visiting order, under the names of `leaves`.
    pub fn collect<B: Backend, M: Module<B>>(&mut self, module: &M, leaves: &[Leaf]) {
        module.visit(&mut Collect {
            exporter: self,
            leaves: leaves.iter(),
        });
    }

    pub fn tensor<B: Backend, const D: usize>(&mut self, leaf: &Leaf, value: &Tensor<B, D>) {
        let data = match leaf.transposed {
            true => value.clone().transpose().into_data(),
            false => value.to_data(),
        };
        self.state.insert(self.scope.key(leaf.name), data);
    }

    /// Stores an integer scalar, the way batch norm layers keep their step counter.
    pub fn counter(&mut self, leaf: &str, value: i64) {
        self.state
            .insert(self.scope.key(leaf), TensorData::new(vec![value], Vec::<usize>::new()));
    }

    pub fn finish(self) -> StateDict {
        self.state
    }
}

struct Collect<'a> {
    exporter: &'a mut StateExporter,
    leaves: slice::Iter<'a, Leaf>,
}

impl<B: Backend> ModuleVisitor<B> for Collect<'_> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        if let Some(leaf) = self.leaves.next() {
            self.exporter.tensor(leaf, tensor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::module::Param;
    use burn::nn::conv::Conv2dConfig;
    use burn::nn::{BatchNormConfig, LinearConfig};

    fn state(entries: &[(&str, &[usize])]) -> StateDict {
        entries
            .iter()
            .map(|(name, shape)| {
                let numel = shape.iter().product();
                (name.to_string(), TensorData::new(vec![1.0f64; numel], shape.to_vec()))
            })
            .collect()
    }

    #[test]
    fn loads_values_by_scoped_name() {
        let device = Default::default();
        let mut loader = StateLoader::new(state(&[("model.fc.bias", &[2])]));

        let bias = loader.scoped("model", |loader| {
            loader.scoped("fc", |loader| {
                loader.tensor(&Leaf::new("bias"), Tensor::<TestBackend, 1>::zeros([2], &device))
            })
        });

        assert!(loader.finish().is_ok());
        assert_eq!(bias.into_data().to_vec::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn collects_every_problem() {
        let device = Default::default();
        let mut state = state(&[("extra.first", &[1]), ("weight", &[3, 2])]);
        state.insert("epoch", Entry::Other("int".to_string()));
        state.insert("running_mean", Entry::Other("NoneType".to_string()));
        let mut loader = StateLoader::new(state);

        let weight = loader.tensor(
            &Leaf::new("weight"),
            Tensor::<TestBackend, 2>::zeros([2, 3], &device),
        );
        loader.tensor(&Leaf::new("bias"), Tensor::<TestBackend, 1>::zeros([2], &device));
        loader.tensor(
            &Leaf::new("running_mean"),
            Tensor::<TestBackend, 1>::zeros([2], &device),
        );
        let mismatch = loader.finish().unwrap_err();

        assert_eq!(weight.dims(), [2, 3]);
        assert_eq!(mismatch.missing, vec!["bias"]);
        assert_eq!(mismatch.unexpected, vec!["extra.first", "epoch"]);
        assert_eq!(mismatch.mismatched[0].found, vec![3, 2]);
        assert_eq!(mismatch.not_tensors[0].name, "running_mean");
        assert_eq!(mismatch.not_tensors[0].found, "NoneType");
    }

    #[test]
    fn optional_entries_may_be_absent() {
        let mut loader = StateLoader::new(state(&[("bn.num_batches_tracked", &[])]));
        loader.scoped("bn", |loader| loader.optional("num_batches_tracked"));
        loader.optional("num_batches_tracked");

        assert!(loader.finish().is_ok());
    }

    #[test]
    fn linear_weights_are_stored_output_major() {
        let device = Default::default();
        let mut linear = LinearConfig::new(2, 3).init::<TestBackend>(&device);
        linear.weight = Param::from_tensor(Tensor::from_floats(
            [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
            &device,
        ));

        let mut exporter = StateExporter::default();
        exporter.scoped("fc", |exporter| linear.export(exporter));
        let state = exporter.finish();
        let weight = state.get("fc.weight").unwrap();
        assert_eq!(weight.shape, vec![3, 2]);
        assert_eq!(
            weight.to_vec::<f32>().unwrap(),
            vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );

        let target = LinearConfig::new(2, 3).init::<TestBackend>(&device);
        let mut loader = StateLoader::new(state);
        let target = loader.scoped("fc", |loader| target.load(loader));
        assert!(loader.finish().is_ok());
        assert_eq!(
            target.weight.val().into_data().to_vec::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn linear_shape_mismatch_is_reported_in_checkpoint_layout() {
        let device = Default::default();
        let linear = LinearConfig::new(4, 2).init::<TestBackend>(&device);
        let mut loader = StateLoader::new(state(&[("weight", &[2, 5]), ("bias", &[2])]));

        let linear = linear.load(&mut loader);
        let mismatch = loader.finish().unwrap_err();

        assert_eq!(linear.weight.dims(), [4, 2]);
        assert_eq!(mismatch.mismatched[0].expected, vec![2, 4]);
        assert_eq!(mismatch.mismatched[0].found, vec![2, 5]);
    }

    #[test]
    fn layers_export_under_torch_names() {
        let device = Default::default();
        let conv = Conv2dConfig::new([3, 4], [1, 1])
            .with_bias(false)
            .init::<TestBackend>(&device);
        let norm = BatchNormConfig::new(4).init::<TestBackend, 2>(&device);
        let blocks = vec![Some(conv), None];

        let mut exporter = StateExporter::default();
        exporter.scoped("layer1", |exporter| {
            blocks.export(exporter);
            exporter.scoped("bn", |exporter| norm.export(exporter));
        });
        let state = exporter.finish();

        let keys: Vec<_> = state.keys().collect();
        assert_eq!(
            keys,
            [
                "layer1.0.weight",
                "layer1.bn.weight",
                "layer1.bn.bias",
                "layer1.bn.running_mean",
                "layer1.bn.running_var",
                "layer1.bn.num_batches_tracked",
            ]
        );
        assert!(state.get("layer1.bn.num_batches_tracked").unwrap().shape.is_empty());
    }

    #[test]
    fn batch_norm_loads_statistics() {
        let device = Default::default();
        let norm = BatchNormConfig::new(2).init::<TestBackend, 2>(&device);
        let mut state = StateDict::new();
        for (name, value) in [
            ("weight", 2.0f32),
            ("bias", 3.0),
            ("running_mean", 4.0),
            ("running_var", 5.0),
        ] {
            state.insert(name, TensorData::new(vec![value; 2], [2]));
        }

        let mut loader = StateLoader::new(state);
        let norm = norm.load(&mut loader);
        assert!(loader.finish().is_ok());

        assert_eq!(norm.gamma.val().into_data().to_vec::<f32>().unwrap(), vec![2.0; 2]);
        assert_eq!(norm.beta.val().into_data().to_vec::<f32>().unwrap(), vec![3.0; 2]);
        assert_eq!(
            norm.running_mean.value().into_data().to_vec::<f32>().unwrap(),
            vec![4.0; 2]
        );
        assert_eq!(
            norm.running_var.value().into_data().to_vec::<f32>().unwrap(),
            vec![5.0; 2]
        );
    }
}
