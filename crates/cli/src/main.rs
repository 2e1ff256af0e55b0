//! The main entrypoint for imgcopy, which just performs global initialization
//! and then calls out into the library.

fn main() {
    imgcopy_utils::initialize_tracing();
    imgcopy_utils::run_main(|| imgcopy_lib::cli::run_from_iter(std::env::args_os()));
}
