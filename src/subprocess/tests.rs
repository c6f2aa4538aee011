#[cfg(test)]
mod tests {
    use super::super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_production_runner_success() {
        let runner = SubprocessManager::production().runner();
        let command = ProcessCommandBuilder::new("echo")
            .arg("hello world")
            .build();

        let output = runner.run(command).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.trim(), "hello world");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_production_runner_failure() {
        let runner = ForkExecRunner::default();
        let command = ProcessCommandBuilder::new("false").build();

        let output = runner.run(command).await.unwrap();
        assert!(!output.status.success());
        assert_eq!(output.status.code(), Some(1));
    }

    #[tokio::test]
    async fn test_production_runner_command_not_found() {
        let runner = ForkExecRunner::default();
        let command = ProcessCommandBuilder::new("nonexistent-command-12345").build();

        let output = runner.run(command).await.unwrap();
        assert_eq!(output.status.code(), Some(EXEC_FAILED_EXIT_CODE));
    }

    #[tokio::test]
    async fn test_production_runner_timeout() {
        let runner = ForkExecRunner::default();
        let command = ProcessCommandBuilder::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100))
            .build();

        let result = runner.run(command).await;
        assert!(matches!(result.unwrap_err(), ProcessError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_production_runner_feeds_stdin() {
        let runner = ForkExecRunner::default();
        let command = ProcessCommandBuilder::new("cat")
            .stdin("line one\nline two\n".to_string())
            .build();

        let output = runner.run(command).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_production_runner_replaced_environment() {
        let runner = ForkExecRunner::default();
        let command = ProcessCommandBuilder::new("/usr/bin/env")
            .env_clear()
            .env("PROCPIPE_ONLY", "1")
            .build();

        let output = runner.run(command).await.unwrap();
        assert_eq!(output.stdout, "PROCPIPE_ONLY=1\n");
    }

    #[tokio::test]
    async fn test_mock_runner_basic() {
        let mut mock = MockProcessRunner::new();

        mock.expect_command("git")
            .with_args(|args| args == ["status"])
            .returns_stdout("On branch main\n")
            .returns_success()
            .finish();

        let output = mock
            .run(ProcessCommandBuilder::new("git").arg("status").build())
            .await
            .unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout, "On branch main\n");
        assert!(mock.verify_called("git", 1));
    }

    #[tokio::test]
    async fn test_mock_runner_multiple_calls() {
        let mut mock = MockProcessRunner::new();

        mock.expect_command("make")
            .with_args(|args| args == ["build"])
            .returns_success()
            .times(2)
            .finish();

        for _ in 0..2 {
            let output = mock
                .run(ProcessCommandBuilder::new("make").arg("build").build())
                .await
                .unwrap();
            assert!(output.status.success());
        }

        assert!(mock.verify_called("make", 2));
        assert!(mock.verify_all().is_ok());

        let result = mock
            .run(ProcessCommandBuilder::new("make").arg("build").build())
            .await;
        assert!(matches!(
            result.unwrap_err(),
            ProcessError::MockExpectationNotMet(_)
        ));
    }

    #[tokio::test]
    async fn test_mock_runner_failure_and_signal() {
        let mut mock = MockProcessRunner::new();

        mock.expect_command("test")
            .with_args(|args| args.first().map(String::as_str) == Some("-f"))
            .returns_exit_code(1)
            .returns_stderr("missing\n")
            .finish();
        mock.expect_command("worker").returns_signal(9).finish();

        let output = mock
            .run(ProcessCommandBuilder::new("test").args(["-f", "x"]).build())
            .await
            .unwrap();
        assert_eq!(output.status, ExitStatus::Error(1));
        assert_eq!(output.stderr, "missing\n");

        let output = mock
            .run(ProcessCommandBuilder::new("worker").build())
            .await
            .unwrap();
        assert_eq!(output.status.code(), Some(137));
    }

    #[tokio::test]
    async fn test_mock_runner_unexpected_command() {
        let mock = MockProcessRunner::new();

        let result = mock.run(ProcessCommandBuilder::new("ls").build()).await;
        assert!(matches!(
            result.unwrap_err(),
            ProcessError::MockExpectationNotMet(_)
        ));
        assert_eq!(mock.get_call_history().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_runner_unmet_count() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("deploy").times(1).finish();

        assert!(mock.verify_all().is_err());
        mock.reset();
        assert!(mock.verify_all().is_ok());
        assert!(mock.get_call_history().is_empty());
    }

    #[tokio::test]
    async fn test_manager_mock_shares_expectations() {
        let (manager, mut mock) = SubprocessManager::mock();
        mock.expect_command("echo").returns_stdout("mocked\n").finish();

        let output = manager
            .runner()
            .run(ProcessCommandBuilder::new("echo").arg("real").build())
            .await
            .unwrap();
        assert_eq!(output.stdout, "mocked\n");
        assert!(mock.verify_called("echo", 1));
    }

    #[test]
    fn test_controller_and_single_shot_agree_on_exit_codes() {
        for code in [0, 1, 42, 255] {
            let script = format!("exit {}", code);
            let mut process = Process::new(
                ProcessCommandBuilder::new("sh")
                    .args(["-c", script.as_str()])
                    .build_config(),
            );
            let controller = process.run().unwrap();

            let single = run_command_args(
                "sh",
                vec!["-c".into(), script.clone()],
                RunOptions::default().capture(true),
            )
            .unwrap();

            assert_eq!(controller, Some(code));
            assert_eq!(single.exit_code(), Some(code));
        }
    }
}
