#[cfg(test)]
#[macro_use]
extern crate maplit;

pub mod assemble;

pub mod collate;
pub use crate::collate::{collate, gather_index, Batch, Example};

pub mod collective;

pub mod config;

pub mod dataset;

pub mod eval;

pub mod io;

pub mod lexicon;

pub mod loader;

pub mod loss;

pub mod model;

pub mod optim;

pub mod preprocess;

pub mod store;

pub mod synonyms;

pub mod target;

pub mod tokenizer;

pub mod train_model;

pub(crate) mod util;
pub use crate::util::{IGNORE_INDEX, N_FINE_EMOTIONS, N_OPTIONS, N_SENTIMENTS};

pub mod vec_simd;

pub mod vocab;

pub mod window;
