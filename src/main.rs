use console::style;
use exhume::app;
use log::{debug, error, log_enabled};

fn main() {
    if let Err(err) = app::run() {
        for cause in err.chain() {
            if log_enabled!(log::Level::Error) {
                error!("{} {}", style("Error:").bold().red(), style(cause).red());
            } else {
                eprintln!("Error: {cause}");
            }
        }
        if log_enabled!(log::Level::Debug) {
            for e in err.chain().skip(1) {
                debug!("Caused by: {}", e);
            }
        }

        std::process::exit(1);
    }
}
