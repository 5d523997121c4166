mod done;
mod download;
mod evaluate;
mod failed;
mod mask_setup;
mod start_job;
mod train;
mod unmask;
mod upload;

pub use self::{
    done::Done,
    download::Download,
    evaluate::Evaluate,
    failed::Failed,
    mask_setup::MaskSetup,
    start_job::StartJob,
    train::Train,
    unmask::Unmask,
    upload::Upload,
};
