mod preprocess;
pub use self::preprocess::PreprocessApp;

mod train;
pub use self::train::TrainApp;

mod traits;
pub use self::traits::IdiomClozeApp;

mod vocab;
pub use self::vocab::VocabApp;
