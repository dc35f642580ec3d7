// Services used by the engine

pub mod images;
