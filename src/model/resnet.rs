use super::layers::{adaptive_avg_pool, add, batch_norm, conv2d, flatten, linear, max_pool, relu};
use super::state::{StateExporter, StateLoader, StateModule};
use crate::checkpoint::StateDict;
use crate::error::ConvertError;
use crate::trace::{Traceable, Traced, Tracer};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::{Tensor, backend::Backend};

/// Output channels of a bottleneck block relative to its width.
pub const EXPANSION: usize = 4;

/// Configuration of a bottleneck ResNet, ResNet-50 by default.
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Number of classes scored by the final layer.
    pub num_classes: usize,
    /// Number of bottleneck blocks in each of the four stages.
    #[config(default = "[3, 4, 6, 3]")]
    pub blocks: [usize; 4],
    /// Width of the stem and of the first stage, doubled at every stage.
    #[config(default = 64)]
    pub base_width: usize,
    #[config(default = 1e-5)]
    pub epsilon: f64,
}

impl ResNetConfig {
    /// Builds a randomly initialized classifier.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<FoodClassifier<B>, ConvertError> {
        if self.num_classes == 0 {
            return Err(ConvertError::InvalidConfig(
                "num_classes must be positive".to_string(),
            ));
        }
        if self.base_width == 0 {
            return Err(ConvertError::InvalidConfig(
                "base_width must be positive".to_string(),
            ));
        }
        if let Some(stage) = self.blocks.iter().position(|blocks| *blocks == 0) {
            return Err(ConvertError::InvalidConfig(format!(
                "stage {} has no block",
                stage + 1
            )));
        }

        Ok(FoodClassifier {
            model: self.init_resnet(device),
        })
    }

    /// Number of features entering the final layer.
    pub fn num_features(&self) -> usize {
        self.base_width * 8 * EXPANSION
    }

    fn batch_norm<B: Backend>(&self, channels: usize, device: &B::Device) -> BatchNorm<B, 2> {
        BatchNormConfig::new(channels)
            .with_epsilon(self.epsilon)
            .init(device)
    }

    fn init_resnet<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let conv1 = conv([3, self.base_width], 7, 2, 3).init(device);
        let bn1 = self.batch_norm(self.base_width, device);
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut in_channels = self.base_width;
        let mut stage = 0;
        let [layer1, layer2, layer3, layer4] = self.blocks.map(|blocks| {
            let width = self.base_width << stage;
            let stride = if stage == 0 { 1 } else { 2 };
            stage += 1;

            (0..blocks)
                .map(|block| {
                    let stride = if block == 0 { stride } else { 1 };
                    let bottleneck = self.init_bottleneck(in_channels, width, stride, device);
                    in_channels = width * EXPANSION;
                    bottleneck
                })
                .collect::<Vec<_>>()
        });

        let avgpool = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let fc = LinearConfig::new(self.num_features(), self.num_classes).init(device);

        ResNet {
            conv1,
            bn1,
            maxpool,
            layer1,
            layer2,
            layer3,
            layer4,
            avgpool,
            fc,
        }
    }

    fn init_bottleneck<B: Backend>(
        &self,
        in_channels: usize,
        width: usize,
        stride: usize,
        device: &B::Device,
    ) -> Bottleneck<B> {
        let out_channels = width * EXPANSION;
        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: conv([in_channels, out_channels], 1, stride, 0).init(device),
            bn: self.batch_norm(out_channels, device),
        });

        Bottleneck {
            conv1: conv([in_channels, width], 1, 1, 0).init(device),
            bn1: self.batch_norm(width, device),
            conv2: conv([width, width], 3, stride, 1).init(device),
            bn2: self.batch_norm(width, device),
            conv3: conv([width, out_channels], 1, 1, 0).init(device),
            bn3: self.batch_norm(out_channels, device),
            downsample,
        }
    }
}

/// Square, bias-free convolution, the only kind a ResNet uses.
fn conv(channels: [usize; 2], kernel_size: usize, stride: usize, padding: usize) -> Conv2dConfig {
    Conv2dConfig::new(channels, [kernel_size, kernel_size])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
}

/// Projection applied to the shortcut when a block changes resolution or channels.
///
/// Stored as `downsample.0` (convolution) and `downsample.1` (normalization).
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    fn forward(&self, x: Traced<B, 4>, tracer: &mut Tracer) -> Traced<B, 4> {
        let x = tracer.scoped(0, |tracer| conv2d(&self.conv, x, tracer));
        tracer.scoped(1, |tracer| batch_norm(&self.bn, x, tracer))
    }
}

impl<B: Backend> StateModule<B> for Downsample<B> {
    fn load(self, loader: &mut StateLoader) -> Self {
        Self {
            conv: loader.scoped(0, |loader| self.conv.load(loader)),
            bn: loader.scoped(1, |loader| self.bn.load(loader)),
        }
    }

    fn export(&self, exporter: &mut StateExporter) {
        exporter.scoped(0, |exporter| self.conv.export(exporter));
        exporter.scoped(1, |exporter| self.bn.export(exporter));
    }
}

/// A 1x1, 3x3, 1x1 residual block, striding on the 3x3 convolution.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub conv3: Conv2d<B>,
    pub bn3: BatchNorm<B, 2>,
    pub downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn forward(&self, x: Traced<B, 4>, tracer: &mut Tracer) -> Traced<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => tracer.scoped("downsample", |tracer| {
                downsample.forward(x.clone(), tracer)
            }),
            None => x.clone(),
        };

        let out = tracer.scoped("conv1", |tracer| conv2d(&self.conv1, x, tracer));
        let out = tracer.scoped("bn1", |tracer| batch_norm(&self.bn1, out, tracer));
        let out = relu(out, tracer);

        let out = tracer.scoped("conv2", |tracer| conv2d(&self.conv2, out, tracer));
        let out = tracer.scoped("bn2", |tracer| batch_norm(&self.bn2, out, tracer));
        let out = relu(out, tracer);

        let out = tracer.scoped("conv3", |tracer| conv2d(&self.conv3, out, tracer));
        let out = tracer.scoped("bn3", |tracer| batch_norm(&self.bn3, out, tracer));

        relu(add(out, identity, tracer), tracer)
    }
}

impl<B: Backend> StateModule<B> for Bottleneck<B> {
    fn load(self, loader: &mut StateLoader) -> Self {
        Self {
            conv1: loader.scoped("conv1", |loader| self.conv1.load(loader)),
            bn1: loader.scoped("bn1", |loader| self.bn1.load(loader)),
            conv2: loader.scoped("conv2", |loader| self.conv2.load(loader)),
            bn2: loader.scoped("bn2", |loader| self.bn2.load(loader)),
            conv3: loader.scoped("conv3", |loader| self.conv3.load(loader)),
            bn3: loader.scoped("bn3", |loader| self.bn3.load(loader)),
            downsample: loader.scoped("downsample", |loader| self.downsample.load(loader)),
        }
    }

    fn export(&self, exporter: &mut StateExporter) {
        exporter.scoped("conv1", |exporter| self.conv1.export(exporter));
        exporter.scoped("bn1", |exporter| self.bn1.export(exporter));
        exporter.scoped("conv2", |exporter| self.conv2.export(exporter));
        exporter.scoped("bn2", |exporter| self.bn2.export(exporter));
        exporter.scoped("conv3", |exporter| self.conv3.export(exporter));
        exporter.scoped("bn3", |exporter| self.bn3.export(exporter));
        exporter.scoped("downsample", |exporter| self.downsample.export(exporter));
    }
}

/// Bottleneck residual network with torchvision's parameter naming.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub maxpool: MaxPool2d,
    pub layer1: Vec<Bottleneck<B>>,
    pub layer2: Vec<Bottleneck<B>>,
    pub layer3: Vec<Bottleneck<B>>,
    pub layer4: Vec<Bottleneck<B>>,
    pub avgpool: AdaptiveAvgPool2d,
    pub fc: Linear<B>,
}

impl<B: Backend> ResNet<B> {
    fn stages(&self) -> [(&'static str, &[Bottleneck<B>]); 4] {
        [
            ("layer1", &self.layer1),
            ("layer2", &self.layer2),
            ("layer3", &self.layer3),
            ("layer4", &self.layer4),
        ]
    }

    fn forward(&self, x: Traced<B, 4>, tracer: &mut Tracer) -> Traced<B, 2> {
        let x = tracer.scoped("conv1", |tracer| conv2d(&self.conv1, x, tracer));
        let x = tracer.scoped("bn1", |tracer| batch_norm(&self.bn1, x, tracer));
        let mut x = max_pool(&self.maxpool, relu(x, tracer), tracer);

        for (name, blocks) in self.stages() {
            x = tracer.scoped(name, |tracer| {
                blocks.iter().enumerate().fold(x, |x, (i, block)| {
                    tracer.scoped(i, |tracer| block.forward(x, tracer))
                })
            });
        }

        let x = flatten(adaptive_avg_pool(&self.avgpool, x, tracer), tracer);
        tracer.scoped("fc", |tracer| linear(&self.fc, x, tracer))
    }
}

/// Pooling layers hold no parameters and are skipped.
impl<B: Backend> StateModule<B> for ResNet<B> {
    fn load(self, loader: &mut StateLoader) -> Self {
        Self {
            conv1: loader.scoped("conv1", |loader| self.conv1.load(loader)),
            bn1: loader.scoped("bn1", |loader| self.bn1.load(loader)),
            layer1: loader.scoped("layer1", |loader| self.layer1.load(loader)),
            layer2: loader.scoped("layer2", |loader| self.layer2.load(loader)),
            layer3: loader.scoped("layer3", |loader| self.layer3.load(loader)),
            layer4: loader.scoped("layer4", |loader| self.layer4.load(loader)),
            fc: loader.scoped("fc", |loader| self.fc.load(loader)),
            ..self
        }
    }

    fn export(&self, exporter: &mut StateExporter) {
        exporter.scoped("conv1", |exporter| self.conv1.export(exporter));
        exporter.scoped("bn1", |exporter| self.bn1.export(exporter));
        exporter.scoped("layer1", |exporter| self.layer1.export(exporter));
        exporter.scoped("layer2", |exporter| self.layer2.export(exporter));
        exporter.scoped("layer3", |exporter| self.layer3.export(exporter));
        exporter.scoped("layer4", |exporter| self.layer4.export(exporter));
        exporter.scoped("fc", |exporter| self.fc.export(exporter));
    }
}

/// The food classifier as it was trained: a ResNet held under the `model` attribute.
#[derive(Module, Debug)]
pub struct FoodClassifier<B: Backend> {
    pub model: ResNet<B>,
}

impl<B: Backend> FoodClassifier<B> {
    /// Scores `[batch_size, 3, height, width]` images, returning `[batch_size, num_classes]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut tracer = Tracer::eager();
        let input = tracer.input(input);
        self.forward_traced(input, &mut tracer).tensor
    }

    /// Replaces every parameter with the checkpoint value of the same name.
    ///
    /// Loading is strict: missing names, unused entries, non-tensor values and shape
    /// disagreements are all reported together and nothing is loaded.
    pub fn load_state_dict(self, state: StateDict) -> Result<Self, ConvertError> {
        let mut loader = StateLoader::new(state);
        let model = loader.scoped("model", |loader| self.model.load(loader));
        loader.finish().map_err(ConvertError::ParameterMismatch)?;

        Ok(Self { model })
    }

    /// Current parameters under their checkpoint names.
    pub fn state_dict(&self) -> StateDict {
        let mut exporter = StateExporter::default();
        exporter.scoped("model", |exporter| self.model.export(exporter));
        exporter.finish()
    }

    pub fn num_classes(&self) -> usize {
        self.model.fc.weight.dims()[1]
    }
}

impl<B: Backend> Traceable<B> for FoodClassifier<B> {
    fn forward_traced(&self, input: Traced<B, 4>, tracer: &mut Tracer) -> Traced<B, 2> {
        tracer.scoped("model", |tracer| self.model.forward(input, tracer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use crate::error::ParameterMismatch;
    use burn::tensor::TensorData;

    fn narrow() -> ResNetConfig {
        ResNetConfig::new(5).with_blocks([1, 1, 1, 1]).with_base_width(2)
    }

    #[test]
    fn parameter_names_follow_torchvision() {
        let device = Default::default();
        let model = ResNetConfig::new(101)
            .with_base_width(4)
            .init::<TestBackend>(&device)
            .unwrap();
        let state = model.state_dict();

        assert_eq!(state.first_key(), Some("model.conv1.weight"));
        assert_eq!(state.get("model.conv1.weight").unwrap().shape, vec![4, 3, 7, 7]);
        assert!(state.get("model.bn1.running_var").is_some());
        assert!(state.get("model.layer1.0.downsample.0.weight").is_some());
        assert!(state.get("model.layer1.1.downsample.0.weight").is_none());
        assert!(state.get("model.layer4.2.bn3.num_batches_tracked").is_some());
        assert_eq!(state.get("model.fc.weight").unwrap().shape, vec![101, 128]);
        assert_eq!(state.get("model.fc.bias").unwrap().shape, vec![101]);
        // 53 convolutions, 53 batch norms with five entries each, the final layer.
        assert_eq!(state.len(), 320);
    }

    #[test]
    fn default_architecture_is_resnet50() {
        let config = ResNetConfig::new(101);
        assert_eq!(config.blocks, [3, 4, 6, 3]);
        assert_eq!(config.num_features(), 2048);
    }

    #[test]
    fn output_has_one_score_per_class() {
        let device = Default::default();
        let model = narrow().init::<TestBackend>(&device).unwrap();
        let output = model.forward(Tensor::zeros([2, 3, 32, 32], &device));

        assert_eq!(output.dims(), [2, 5]);
        assert_eq!(model.num_classes(), 5);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let device = Default::default();
        let err = narrow()
            .with_blocks([1, 0, 1, 1])
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert!(matches!(err, ConvertError::InvalidConfig(_)));

        let err = ResNetConfig::new(0).init::<TestBackend>(&device).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidConfig(_)));
    }

    #[test]
    fn state_dict_round_trips_through_loading() {
        let device = Default::default();
        let source = narrow().init::<TestBackend>(&device).unwrap();
        let target = narrow().init::<TestBackend>(&device).unwrap();

        let loaded = target.load_state_dict(source.state_dict()).unwrap();
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);

        let expected = source.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = loaded.forward(input).into_data().to_vec::<f32>().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn batch_counters_are_optional() {
        let device = Default::default();
        let model = narrow().init::<TestBackend>(&device).unwrap();
        let state: StateDict = model
            .state_dict()
            .into_iter()
            .filter(|(name, _)| !name.ends_with("num_batches_tracked"))
            .collect();

        assert!(model.load_state_dict(state).is_ok());
    }

    #[test]
    fn strict_loading_reports_all_problems() {
        let device = Default::default();
        let model = narrow().init::<TestBackend>(&device).unwrap();
        let mut state: StateDict = model
            .state_dict()
            .into_iter()
            .filter(|(name, _)| name != "model.fc.bias")
            .collect();
        state.insert("model.head.weight", TensorData::new(vec![0.0f32], [1]));
        state.insert(
            "model.conv1.weight",
            TensorData::new(vec![0.0f32; 2 * 7 * 7], [2, 1, 7, 7]),
        );

        let ParameterMismatch {
            missing,
            unexpected,
            mismatched,
            ..
        } = match model.load_state_dict(state) {
            Err(ConvertError::ParameterMismatch(mismatch)) => mismatch,
            other => panic!("expected a parameter mismatch, got {other:?}"),
        };

        assert_eq!(missing, vec!["model.fc.bias"]);
        assert_eq!(unexpected, vec!["model.head.weight"]);
        assert_eq!(mismatched.len(), 1);
        assert_eq!(mismatched[0].name, "model.conv1.weight");
    }
}
