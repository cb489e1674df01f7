fn main() -> std::process::ExitCode {
    paperchat_lib::run()
}
