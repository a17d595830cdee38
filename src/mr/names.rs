//! The naming convention shared by the master and the workers. Both sides
//! build these names independently, so they must agree byte for byte.

/// Path prefix every file server exposes its work directory under.
pub const DATA_DIR: &str = "data";

/// Splitter output pattern; substituting a task ordinal for `{}` must yield
/// [`map_source_file`] of that ordinal.
pub const MAP_SOURCE_PATTERN: &str = "map_{}_source.sqlite3";

/// Scratch name reused for every download that feeds a merge.
pub const SCRATCH_FILE: &str = "temp.sqlite3";

/// The merged job result, written on the master.
pub const FINAL_FILE: &str = "final.sqlite3";

/// Input shard for map task `n`, hosted by the master.
pub fn map_source_file(n: usize) -> String {
    format!("map_{n}_source.sqlite3")
}

/// Local copy of map task `n`'s shard on the worker.
pub fn map_input_file(n: usize) -> String {
    format!("map_{n}_input.sqlite3")
}

/// Map task `n`'s output partition `r`, hosted by the worker that ran it.
pub fn map_output_file(n: usize, r: usize) -> String {
    format!("map_{n}_output_{r}.sqlite3")
}

/// Reduce task `r`'s merged input, local to the reduce worker.
pub fn reduce_input_file(r: usize) -> String {
    format!("reduce_{r}_input.sqlite3")
}

/// Reduce task `r`'s output, hosted by the worker that ran it.
pub fn reduce_output_file(r: usize) -> String {
    format!("reduce_{r}_output.sqlite3")
}

pub fn make_url(host: &str, file: &str) -> String {
    format!("http://{host}/{DATA_DIR}/{file}")
}
