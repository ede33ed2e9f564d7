fn main() {
    let code = match taiga::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("taiga: {:#}", err);
            3
        }
    };
    std::process::exit(code);
}
