mod download;
mod mask_setup;
mod start_job;
mod train;
mod unmask;
mod upload;
