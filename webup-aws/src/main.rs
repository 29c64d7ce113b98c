mod create;
mod deploy;
mod destroy;
mod monitor;
mod scale;
mod schedule_teardown;

use std::io;

use clap::{crate_version, Command};

const APP_NAME: &str = "webup-aws";

#[tokio::main]
async fn main() -> io::Result<()> {
    let matches = Command::new(APP_NAME)
        .version(crate_version!())
        .about("Web stack control plane on AWS")
        .subcommands(vec![
            create::command(),
            deploy::command(),
            scale::command(),
            destroy::command(),
            schedule_teardown::command(),
            monitor::command(),
        ])
        .get_matches();

    match matches.subcommand() {
        Some((create::NAME, sub_matches)) => {
            create::execute(
                &sub_matches
                    .get_one::<String>("LOG_LEVEL")
                    .unwrap_or(&String::from("info"))
                    .clone(),
                &sub_matches
                    .get_one::<String>("CONFIG_FILE_PATH")
                    .unwrap()
                    .clone(),
            )
            .await?;
        }

        Some((deploy::NAME, sub_matches)) => {
            deploy::execute(
                &sub_matches
                    .get_one::<String>("LOG_LEVEL")
                    .unwrap_or(&String::from("info"))
                    .clone(),
                &sub_matches
                    .get_one::<String>("CONFIG_FILE_PATH")
                    .unwrap()
                    .clone(),
            )
            .await?;
        }

        Some((scale::NAME, sub_matches)) => {
            scale::execute(
                &sub_matches
                    .get_one::<String>("LOG_LEVEL")
                    .unwrap_or(&String::from("info"))
                    .clone(),
                &sub_matches
                    .get_one::<String>("CONFIG_FILE_PATH")
                    .unwrap()
                    .clone(),
            )
            .await?;
        }

        Some((destroy::NAME, sub_matches)) => {
            destroy::execute(
                &sub_matches
                    .get_one::<String>("LOG_LEVEL")
                    .unwrap_or(&String::from("info"))
                    .clone(),
                &sub_matches
                    .get_one::<String>("CONFIG_FILE_PATH")
                    .unwrap()
                    .clone(),
                sub_matches.get_flag("SKIP_PROMPT"),
            )
            .await?;
        }

        Some((schedule_teardown::NAME, sub_matches)) => {
            schedule_teardown::execute(
                &sub_matches
                    .get_one::<String>("LOG_LEVEL")
                    .unwrap_or(&String::from("info"))
                    .clone(),
                &sub_matches
                    .get_one::<String>("CONFIG_FILE_PATH")
                    .unwrap()
                    .clone(),
            )
            .await?;
        }

        Some((monitor::NAME, sub_matches)) => {
            monitor::execute(
                &sub_matches
                    .get_one::<String>("LOG_LEVEL")
                    .unwrap_or(&String::from("info"))
                    .clone(),
                &sub_matches
                    .get_one::<String>("CONFIG_FILE_PATH")
                    .unwrap()
                    .clone(),
            )
            .await?;
        }

        _ => unreachable!("unknown subcommand"),
    }

    Ok(())
}
