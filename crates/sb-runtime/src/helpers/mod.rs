pub(crate) mod function_source;
pub(crate) mod value_path;
