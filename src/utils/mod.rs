pub mod journal;
#[cfg(test)]
pub mod test_utils;
pub mod url;
