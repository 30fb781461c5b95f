use burn::backend::{Autodiff, NdArray};
use food_model_convert::{ConvertConfig, convert, logger::init_log, paths::program_dir};
use log::LevelFilter;
use std::process::ExitCode;

type Backend = Autodiff<NdArray<f32>>;

/// Converts `lib/features/chat/models/best_food_model.pth` into `assets/models/food_model.pt`.
fn main() -> ExitCode {
    if let Err(err) = init_log(LevelFilter::Info) {
        eprintln!("Failed to initialize logging: {err}");
    }

    let device = Default::default();
    match convert::<Backend>(&ConvertConfig::default(), &program_dir(), &device) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("Error during model conversion: {err}");
            ExitCode::FAILURE
        }
    }
}
